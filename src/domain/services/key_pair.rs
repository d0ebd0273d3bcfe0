use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::utils::id::UserId;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub name: String,
    pub user_id: UserId,
    pub public_key: String,
}

pub trait KeyPairService: Debug + Send + Sync {
    fn get(&self, user_id: &UserId, name: &str) -> Result<KeyPair>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryKeyPairService {
    key_pairs: Arc<RwLock<HashMap<(UserId, String), KeyPair>>>,
}

impl InMemoryKeyPairService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key_pair: KeyPair) {
        self.key_pairs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((key_pair.user_id.clone(), key_pair.name.clone()), key_pair);
    }
}

impl KeyPairService for InMemoryKeyPairService {
    fn get(&self, user_id: &UserId, name: &str) -> Result<KeyPair> {
        self.key_pairs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(user_id.clone(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found("Keypair", name))
    }
}
