pub mod backends;
pub mod config;
pub mod connections;
pub mod dialect;
pub mod error;
pub mod etl;
pub mod executor;
pub mod models;
pub mod query_builder;
pub mod schema_cache;
pub mod sql_ast;
pub mod telemetry;

pub use config::CanvasqlConfig;
pub use connections::{ConnectionFactory, ConnectionProfile, DatasourceStore, Driver};
pub use error::{CanvasqlError, ErrorEnvelope};
pub use etl::{EtlEngine, EtlMode, EtlReport, EtlRequest};
pub use executor::QueryService;
pub use models::{QueryRequest, QueryResponse};
pub use query_builder::{compile, CompiledQuery, QueryCompiler};
pub use schema_cache::{SchemaCatalog, SchemaMetadata};
