//! Configuration system for canvasql.
//!
//! TOML-based configuration with defaults for every section. The warehouse
//! profile is the single fixed destination used by the ETL engine and by
//! queries against replicated tables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connections::{ConnectionProfile, Driver};
use crate::error::{CanvasqlError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CanvasqlConfig {
    pub warehouse: WarehouseConfig,
    pub query: QueryConfig,
    pub pool: PoolConfig,
    pub schema_cache: SchemaCacheConfig,
    pub etl: EtlConfig,
    pub datasources: DatasourcesConfig,
}

/// Connection settings for the warehouse database.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub schema: String,
}

impl std::fmt::Debug for WarehouseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .field("schema", &self.schema)
            .finish()
    }
}

/// Query compilation and execution settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Statement timeout in milliseconds (default: 30000).
    pub timeout_ms: u64,
    /// Schema introspected when a profile does not name one.
    pub default_schema: String,
    /// Bookkeeping tables hidden from table listings.
    pub excluded_tables: Vec<String>,
}

/// Connection pooling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum pool size (default: 16).
    pub size: usize,
    /// Connect timeout in milliseconds (default: 10000).
    pub connect_timeout_ms: u64,
}

/// Schema snapshot cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchemaCacheConfig {
    /// Reuse snapshots across requests (default: false).
    pub enabled: bool,
    /// Snapshot TTL in seconds (default: 300).
    pub ttl_secs: u64,
    /// Maximum cached snapshots (default: 64).
    pub max_size: usize,
}

/// Bulk copy constants for the ETL engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EtlConfig {
    /// Rows fetched from the source per cursor round trip.
    pub read_chunk_size: usize,
    /// Rows written per INSERT statement.
    pub insert_batch_size: usize,
    /// Tables copied concurrently within one run.
    pub table_parallelism: usize,
    /// Statement timeout for source and warehouse sessions, in milliseconds.
    pub statement_timeout_ms: u64,
}

/// Where datasource records are read from.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatasourcesConfig {
    /// Directory of YAML datasource records.
    pub dir: Option<PathBuf>,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "warehouse".to_string(),
            username: "postgres".to_string(),
            password: String::new(),
            schema: "public".to_string(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            default_schema: "public".to_string(),
            excluded_tables: vec![
                "migrations".to_string(),
                "personal_access_tokens".to_string(),
            ],
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 16,
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 300,
            max_size: 64,
        }
    }
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 1000,
            insert_batch_size: 500,
            table_parallelism: 1,
            statement_timeout_ms: 300_000,
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl WarehouseConfig {
    pub fn profile(&self) -> ConnectionProfile {
        ConnectionProfile {
            driver: Driver::Postgres,
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            schema: self.schema.clone(),
        }
    }
}

impl CanvasqlConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CanvasqlError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(toml_str)
            .map_err(|e| CanvasqlError::Config(format!("failed to parse config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from default locations (env var, cwd, user config dir, or defaults).
    ///
    /// Search order:
    /// 1. `CANVASQL_CONFIG` environment variable
    /// 2. `./canvasql.toml` (current directory)
    /// 3. `~/.config/canvasql/config.toml` (user config dir)
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("CANVASQL_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "loaded config from CANVASQL_CONFIG");
                    return cfg;
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "ignoring CANVASQL_CONFIG"),
            }
        }

        if let Ok(cfg) = Self::from_file("canvasql.toml") {
            tracing::info!("loaded config from ./canvasql.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("canvasql").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        if self.etl.read_chunk_size == 0 || self.etl.insert_batch_size == 0 {
            return Err(CanvasqlError::Config(
                "etl chunk and batch sizes must be positive".to_string(),
            ));
        }
        if self.etl.table_parallelism == 0 {
            return Err(CanvasqlError::Config(
                "etl.table_parallelism must be at least 1".to_string(),
            ));
        }
        if self.pool.size == 0 {
            return Err(CanvasqlError::Config("pool.size must be positive".to_string()));
        }
        Ok(())
    }
}
