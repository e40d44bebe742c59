//! Key lookup.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::protocol::{ErrorCode, Op, Ski};

/// A private key able to serve keyless operations.
pub trait KeyOperator: Send + Sync {
    /// Sign a pre-hashed `digest` as requested by `op`.
    fn sign(&self, op: Op, digest: &[u8]) -> Result<Vec<u8>, ErrorCode>;

    /// Decrypt an RSA ciphertext. Keys that cannot decrypt keep the default.
    fn decrypt(&self, _ciphertext: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        Err(ErrorCode::UnexpectedOpcode)
    }
}

/// Source of keys, addressed by SKI.
pub trait Keystore: Send + Sync {
    fn get(&self, ski: &Ski) -> Option<Arc<dyn KeyOperator>>;
}

/// In-process keystore.
#[derive(Default)]
pub struct MemoryKeystore {
    keys: RwLock<HashMap<Ski, Arc<dyn KeyOperator>>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the key served under `ski`.
    pub fn insert(&self, ski: Ski, key: Arc<dyn KeyOperator>) {
        tracing::info!(ski = %ski, "Key registered");
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ski, key);
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Keystore for MemoryKeystore {
    fn get(&self, ski: &Ski) -> Option<Arc<dyn KeyOperator>> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ski)
            .cloned()
    }
}
