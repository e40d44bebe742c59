//! Operation execution.
//!
//! # Data Flow
//! ```text
//! Job popped by a worker
//!     → Executor::execute (opcode → handler lookup)
//!     → handler: ping echo | sign | decrypt
//!     → keystore.rs (SKI → KeyOperator)
//!     → Ok(payload) or Err(ErrorCode)
//! ```
//!
//! # Design Decisions
//! - Handlers are plain functions selected by a `match` on the opcode enum
//! - Cryptography lives behind `KeyOperator`; this crate only routes to it
//! - Every failure is an `ErrorCode`, never a panic or a dropped request

pub mod keystore;

use std::sync::Arc;

use crate::protocol::{ErrorCode, Op, Operation};

pub use keystore::{KeyOperator, Keystore, MemoryKeystore};

/// Handler for one opcode.
pub type Handler = fn(&Executor, &Operation) -> Result<Vec<u8>, ErrorCode>;

/// Runs operations against the configured keystore.
pub struct Executor {
    keystore: Arc<dyn Keystore>,
}

impl Executor {
    pub fn new(keystore: Arc<dyn Keystore>) -> Self {
        Self { keystore }
    }

    /// Look up the handler for an opcode.
    pub fn handler(op: Op) -> Option<Handler> {
        match op {
            Op::Ping => Some(ping),
            Op::RsaDecrypt => Some(decrypt),
            op if op.is_sign() => Some(sign),
            _ => None,
        }
    }

    pub fn execute(&self, operation: &Operation) -> Result<Vec<u8>, ErrorCode> {
        let handler = Self::handler(operation.opcode).ok_or(ErrorCode::BadOpcode)?;
        handler(self, operation)
    }

    fn key_for(&self, operation: &Operation) -> Result<Arc<dyn KeyOperator>, ErrorCode> {
        let ski = operation.ski.ok_or(ErrorCode::Format)?;
        self.keystore.get(&ski).ok_or(ErrorCode::KeyNotFound)
    }
}

fn ping(_: &Executor, operation: &Operation) -> Result<Vec<u8>, ErrorCode> {
    Ok(operation.payload.clone())
}

fn sign(executor: &Executor, operation: &Operation) -> Result<Vec<u8>, ErrorCode> {
    if operation.payload.is_empty() {
        return Err(ErrorCode::Format);
    }
    let key = executor.key_for(operation)?;
    key.sign(operation.opcode, &operation.payload)
}

fn decrypt(executor: &Executor, operation: &Operation) -> Result<Vec<u8>, ErrorCode> {
    if operation.payload.is_empty() {
        return Err(ErrorCode::Format);
    }
    let key = executor.key_for(operation)?;
    key.decrypt(&operation.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Ski;

    struct Reverser;

    impl KeyOperator for Reverser {
        fn sign(&self, _op: Op, digest: &[u8]) -> Result<Vec<u8>, ErrorCode> {
            Ok(digest.iter().rev().copied().collect())
        }
    }

    fn executor() -> Executor {
        let keystore = MemoryKeystore::new();
        keystore.insert(Ski([1; 20]), Arc::new(Reverser));
        Executor::new(Arc::new(keystore))
    }

    #[test]
    fn ping_echoes_payload() {
        let op = Operation::new(Op::Ping, b"hello".to_vec());
        assert_eq!(executor().execute(&op), Ok(b"hello".to_vec()));
    }

    #[test]
    fn sign_uses_registered_key() {
        let op = Operation::new(Op::EcdsaSignSha256, vec![1, 2, 3]).with_key(Ski([1; 20]), None);
        assert_eq!(executor().execute(&op), Ok(vec![3, 2, 1]));
    }

    #[test]
    fn unknown_key_and_missing_ski() {
        let unknown = Operation::new(Op::RsaSignSha256, vec![1]).with_key(Ski([9; 20]), None);
        assert_eq!(executor().execute(&unknown), Err(ErrorCode::KeyNotFound));

        let no_ski = Operation::new(Op::RsaSignSha256, vec![1]);
        assert_eq!(executor().execute(&no_ski), Err(ErrorCode::Format));
    }

    #[test]
    fn decrypt_defaults_to_unsupported() {
        let op = Operation::new(Op::RsaDecrypt, vec![1]).with_key(Ski([1; 20]), None);
        assert_eq!(executor().execute(&op), Err(ErrorCode::UnexpectedOpcode));
    }

    #[test]
    fn unknown_opcode_is_bad_opcode() {
        let op = Operation::new(Op::Unknown(0x99), vec![]);
        assert_eq!(executor().execute(&op), Err(ErrorCode::BadOpcode));
    }
}
