//! Connection registry: datasource records, connection profiles and the
//! factory that turns a profile into a caller-owned connection pool.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use glob::glob;
use serde::{Deserialize, Serialize};

use crate::backends::PostgresConnection;
use crate::config::{CanvasqlConfig, PoolConfig};
use crate::error::{CanvasqlError, Result};
use crate::etl::EtlRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    Postgres,
    MySql,
    SqlServer,
    Sqlite,
}

impl FromStr for Driver {
    type Err = CanvasqlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pgsql" | "postgres" | "postgresql" => Ok(Driver::Postgres),
            "mysql" | "mariadb" => Ok(Driver::MySql),
            "sqlsrv" | "sqlserver" | "mssql" => Ok(Driver::SqlServer),
            "sqlite" => Ok(Driver::Sqlite),
            other => Err(CanvasqlError::UnsupportedDriver(other.to_string())),
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Driver::Postgres => "pgsql",
            Driver::MySql => "mysql",
            Driver::SqlServer => "sqlsrv",
            Driver::Sqlite => "sqlite",
        };
        f.write_str(name)
    }
}

/// One physical database. Lives for a single request or ETL run.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub driver: Driver,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub schema: String,
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .field("schema", &self.schema)
            .finish()
    }
}

impl ConnectionProfile {
    /// ETL sources are always PostgreSQL, introspected in `public`.
    pub fn from_etl_request(request: &EtlRequest) -> Self {
        Self {
            driver: Driver::Postgres,
            host: request.host.clone(),
            port: request.port,
            database: request.database.clone(),
            username: request.username.clone(),
            password: request.password.clone(),
            schema: "public".to_string(),
        }
    }
}

/// A stored datasource row, as persisted by the surrounding application.
#[derive(Clone, Deserialize, Serialize)]
pub struct DatasourceRecord {
    #[serde(alias = "id_datasource")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "type")]
    pub driver: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(alias = "database_name")]
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub schema: Option<String>,
}

fn default_port() -> u16 {
    5432
}

impl fmt::Debug for DatasourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasourceRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl DatasourceRecord {
    pub fn profile(&self, default_schema: &str) -> Result<ConnectionProfile> {
        Ok(ConnectionProfile {
            driver: self.driver.parse()?,
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            schema: self
                .schema
                .clone()
                .unwrap_or_else(|| default_schema.to_string()),
        })
    }
}

/// Read-only view of the datasource table owned by the host application.
#[async_trait]
pub trait DatasourceStore: Send + Sync {
    async fn resolve(&self, id: &str) -> Result<ConnectionProfile>;
}

#[derive(Debug, Clone)]
pub struct InMemoryDatasourceStore {
    records: HashMap<String, DatasourceRecord>,
    default_schema: String,
}

impl Default for InMemoryDatasourceStore {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            default_schema: "public".to_string(),
        }
    }
}

impl InMemoryDatasourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = schema.into();
        self
    }

    pub fn insert(&mut self, record: DatasourceRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DatasourceStore for InMemoryDatasourceStore {
    async fn resolve(&self, id: &str) -> Result<ConnectionProfile> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| CanvasqlError::UnknownDatasource(id.to_string()))?;
        record.profile(&self.default_schema)
    }
}

/// Datasource records loaded from a directory, one YAML document per file.
#[derive(Debug, Clone, Default)]
pub struct YamlDatasourceStore {
    inner: InMemoryDatasourceStore,
}

impl YamlDatasourceStore {
    pub fn load_from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Err(CanvasqlError::Validation(format!(
                "datasources directory not found: {}",
                dir.display()
            )));
        }
        let mut inner = InMemoryDatasourceStore::new();
        for pattern in ["*.yml", "*.yaml"] {
            for entry in glob(&format!("{}/{pattern}", dir.display()))
                .map_err(|e| CanvasqlError::Other(e.into()))?
                .flatten()
            {
                let contents = fs::read_to_string(&entry)?;
                let record: DatasourceRecord = serde_yaml::from_str(&contents)?;
                tracing::debug!(id = %record.id, path = %entry.display(), "loaded datasource");
                inner.insert(record);
            }
        }
        Ok(Self { inner })
    }

    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.inner = self.inner.with_default_schema(schema);
        self
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl DatasourceStore for YamlDatasourceStore {
    async fn resolve(&self, id: &str) -> Result<ConnectionProfile> {
        self.inner.resolve(id).await
    }
}

/// Builds caller-owned pools from profiles. Nothing is registered globally;
/// dropping the returned connection closes its pool.
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    pool: PoolConfig,
    statement_timeout_ms: u64,
}

impl ConnectionFactory {
    pub fn new(pool: PoolConfig, statement_timeout_ms: u64) -> Self {
        Self {
            pool,
            statement_timeout_ms,
        }
    }

    /// Factory for interactive queries (`query.timeout_ms`).
    pub fn for_queries(config: &CanvasqlConfig) -> Self {
        Self::new(config.pool.clone(), config.query.timeout_ms)
    }

    /// Factory for ETL sessions (`etl.statement_timeout_ms`).
    pub fn for_etl(config: &CanvasqlConfig) -> Self {
        Self::new(config.pool.clone(), config.etl.statement_timeout_ms)
    }

    pub fn connect(&self, profile: &ConnectionProfile) -> Result<PostgresConnection> {
        match profile.driver {
            Driver::Postgres => {
                PostgresConnection::connect(profile, &self.pool, self.statement_timeout_ms)
            }
            other => Err(CanvasqlError::UnsupportedDriver(other.to_string())),
        }
    }
}
