// In-memory identity store, optionally seeded from a JSON file

use super::{Identity, IdentityStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;

/// Identity records held in process memory.
///
/// Stands in for the external user database: the relay only ever reads it.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    users: RwLock<HashMap<String, Identity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        let store = Self::new();
        for identity in identities {
            store.insert(identity);
        }
        store
    }

    /// Load a JSON array of identity records
    pub fn load_json(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read identity file {}", path.display()))?;
        let identities: Vec<Identity> =
            serde_json::from_str(&contents).context("Failed to parse identity file")?;
        Ok(Self::with_identities(identities))
    }

    /// Add or replace a record
    pub fn insert(&self, identity: Identity) {
        self.users.write().insert(identity.id.clone(), identity);
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_by_id(&self, id: &str) -> Option<Identity> {
        self.users.read().get(id).cloned()
    }

    async fn linked_to(&self, patient_id: &str) -> Vec<Identity> {
        let mut linked: Vec<Identity> = self
            .users
            .read()
            .values()
            .filter(|u| u.is_linked_to(patient_id))
            .cloned()
            .collect();
        linked.sort_by(|a, b| a.id.cmp(&b.id));
        linked
    }
}
