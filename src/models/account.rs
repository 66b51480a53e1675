//! Represents a configured storage account.

use crate::services::backend::RemoteObjectStore;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};

/// Capabilities an account can be registered for.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    MetricsStore,
    ObjectStore,
    ConfigurationStore,
    RemoteJudge,
}

impl FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "METRICS_STORE" => Ok(AccountType::MetricsStore),
            "OBJECT_STORE" => Ok(AccountType::ObjectStore),
            "CONFIGURATION_STORE" => Ok(AccountType::ConfigurationStore),
            "REMOTE_JUDGE" => Ok(AccountType::RemoteJudge),
            other => Err(format!("unknown account type `{}`", other)),
        }
    }
}

/// A storage destination: one bucket below one root folder, reached through
/// one remote-store client.
///
/// Accounts are built once at startup and never mutated; they are shared as
/// `Arc<Account>` through the [`AccountRegistry`](crate::services::accounts::AccountRegistry).
#[derive(Clone)]
pub struct Account {
    /// Registry key.
    pub name: String,

    /// What this account may be used for.
    pub supported_types: Vec<AccountType>,

    /// Bucket (container) holding every object of the account.
    pub bucket: String,

    /// Region the bucket lives in.
    pub region: String,

    /// Folder prefix every object path starts with. May be empty.
    pub root_folder: String,

    /// Client used for all remote calls.
    pub client: Arc<dyn RemoteObjectStore>,
}

impl Account {
    pub fn supports(&self, account_type: AccountType) -> bool {
        self.supported_types.contains(&account_type)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("name", &self.name)
            .field("supported_types", &self.supported_types)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("root_folder", &self.root_folder)
            .field("client", &self.client.kind())
            .finish()
    }
}
