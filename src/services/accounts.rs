//! Registry of configured accounts, keyed by name.

use crate::models::account::Account;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

#[derive(Default)]
pub struct AccountRegistry {
    accounts: RwLock<HashMap<String, Arc<Account>>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `account`, replacing any account with the same name.
    pub fn save(&self, account: Account) {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        accounts.insert(account.name.clone(), Arc::new(account));
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Account>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.get(name).cloned()
    }

    /// All accounts, ordered by name.
    pub fn all(&self) -> Vec<Arc<Account>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = accounts.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
