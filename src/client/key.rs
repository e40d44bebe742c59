//! Remote private key handle.

use std::fmt;

use crate::client::{Client, ClientError};
use crate::protocol::{Digest, Op, Operation, Ski};

/// A private key held by one or more keyservers.
///
/// Operations are routed through [`Client::dial_any`] on every call, so a
/// handle survives individual keyservers going away.
#[derive(Clone)]
pub struct PrivateKey {
    public_key: Vec<u8>,
    ski: Ski,
    digest: Digest,
    client: Client,
}

impl PrivateKey {
    pub(crate) fn new(public_key: Vec<u8>, ski: Ski, client: Client) -> Self {
        let digest = Digest::from_spki_der(&public_key);
        Self {
            public_key,
            ski,
            digest,
            client,
        }
    }

    /// DER-encoded SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key
    }

    pub fn ski(&self) -> Ski {
        self.ski
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// Sign a prehashed `digest` with the signing opcode `op`.
    pub async fn sign(&self, op: Op, digest: &[u8]) -> Result<Vec<u8>, ClientError> {
        if !op.is_sign() {
            return Err(ClientError::Unsupported(op));
        }
        self.execute(op, digest).await
    }

    /// RSA-decrypt `ciphertext`.
    pub async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ClientError> {
        self.execute(Op::RsaDecrypt, ciphertext).await
    }

    async fn execute(&self, op: Op, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        let conn = self.client.dial_any(&self.ski).await?;
        let operation = Operation::new(op, payload.to_vec()).with_key(self.ski, Some(self.digest));
        let response = conn.do_operation(operation).await?;
        Ok(response.payload)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("ski", &self.ski)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}
