use crate::{models::account::AccountType, services::retry::RetryPolicy};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub account: AccountConfig,
    pub retry: RetryPolicy,
}

/// The single object-store account registered at startup.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub name: String,
    pub bucket: String,
    pub root_folder: String,
    pub region: String,
    pub supported_types: Vec<AccountType>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Canary config object store")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding bucket directories (overrides OBJECT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Index database URL (overrides OBJECT_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Account name (overrides OBJECT_STORE_ACCOUNT_NAME)
    #[arg(long)]
    pub account_name: Option<String>,

    /// Bucket for the account (overrides OBJECT_STORE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Root folder inside the bucket (overrides OBJECT_STORE_ROOT_FOLDER)
    #[arg(long)]
    pub root_folder: Option<String>,

    /// Region of the bucket (overrides OBJECT_STORE_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// Comma-separated account capabilities (overrides OBJECT_STORE_SUPPORTED_TYPES)
    #[arg(long)]
    pub supported_types: Option<String>,

    /// Attempts per put/delete (overrides OBJECT_STORE_MAX_RETRIES)
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Milliseconds between attempts (overrides OBJECT_STORE_RETRY_BACKOFF_MS)
    #[arg(long)]
    pub retry_backoff_ms: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` and parse it, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn parse_supported_types(raw: &str) -> Result<Vec<AccountType>> {
    let types = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| AccountType::from_str(s).map_err(|e| anyhow!(e)))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("parsing supported types `{}`", raw))?;
    if types.is_empty() {
        anyhow::bail!("at least one supported type is required");
    }
    Ok(types)
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_env_with(args)?, migrate))
    }

    /// Merge `args` over the environment, then over defaults.
    pub fn from_env_with(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env_or("OBJECT_STORE_HOST", "0.0.0.0".to_string())?;
        let env_port = env_or("OBJECT_STORE_PORT", 3000u16)?;
        let env_storage = env_or("OBJECT_STORE_STORAGE_DIR", "./data/objects".to_string())?;
        let env_db = env_or(
            "OBJECT_STORE_DATABASE_URL",
            "sqlite://./data/meta/index.db".to_string(),
        )?;
        let env_account = env_or("OBJECT_STORE_ACCOUNT_NAME", "local".to_string())?;
        let env_bucket = env_or("OBJECT_STORE_BUCKET", "kayenta".to_string())?;
        let env_root = env_or("OBJECT_STORE_ROOT_FOLDER", "kayenta".to_string())?;
        let env_region = env_or("OBJECT_STORE_REGION", "local".to_string())?;
        let env_types = env_or(
            "OBJECT_STORE_SUPPORTED_TYPES",
            "OBJECT_STORE,CONFIGURATION_STORE".to_string(),
        )?;
        let defaults = RetryPolicy::default();
        let env_retries = env_or("OBJECT_STORE_MAX_RETRIES", defaults.max_attempts)?;
        let env_backoff = env_or(
            "OBJECT_STORE_RETRY_BACKOFF_MS",
            defaults.backoff.as_millis() as u64,
        )?;

        // --- Merge ---
        let supported_types = parse_supported_types(&args.supported_types.unwrap_or(env_types))?;
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            account: AccountConfig {
                name: args.account_name.unwrap_or(env_account),
                bucket: args.bucket.unwrap_or(env_bucket),
                root_folder: args.root_folder.unwrap_or(env_root),
                region: args.region.unwrap_or(env_region),
                supported_types,
            },
            retry: RetryPolicy::new(
                args.max_retries.unwrap_or(env_retries),
                Duration::from_millis(args.retry_backoff_ms.unwrap_or(env_backoff)),
            ),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
