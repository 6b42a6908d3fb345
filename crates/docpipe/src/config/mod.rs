pub mod loader;
pub mod schema;

pub use loader::{
    default_config_path, load_config, load_config_from_str, load_config_or_default,
    resolve_database_path,
};
pub use schema::{
    AuditConfig, AuditSinkKind, ChunkingConfig, Config, ExtractionConfig, RetryConfig,
    WorkerConfig,
};
