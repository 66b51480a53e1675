use anyhow::{Context, Result};
use axum::Router;
use config_object_store::{
    config::AppConfig,
    models::account::Account,
    routes,
    services::{
        accounts::AccountRegistry, local_disk::LocalDiskObjectStore,
        sqlite_index::SqliteCanaryConfigIndex, storage_service::ObjectStoreStorageService,
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting config-object-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url `{}`", db_url))?
        .create_if_missing(true);
    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    let index = Arc::new(SqliteCanaryConfigIndex::new(db));

    // --- Handle migration mode ---
    index.migrate().await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Register the configured account ---
    let registry = Arc::new(AccountRegistry::new());
    registry.save(Account {
        name: cfg.account.name.clone(),
        supported_types: cfg.account.supported_types.clone(),
        bucket: cfg.account.bucket.clone(),
        region: cfg.account.region.clone(),
        root_folder: cfg.account.root_folder.clone(),
        client: Arc::new(LocalDiskObjectStore::new(&cfg.storage_dir)),
    });

    // --- Initialize core service ---
    let storage = ObjectStoreStorageService::from_registry(
        registry,
        LocalDiskObjectStore::KIND,
        index,
        cfg.retry,
    );

    let account_names: Vec<String> = storage.account_names().map(String::from).collect();
    for name in &account_names {
        storage
            .provision_account(name)
            .await
            .with_context(|| format!("provisioning account {}", name))?;
    }

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
