pub mod connection;
pub mod ingestion;
pub mod pool;
pub mod shutdown;

pub use connection::{ConnectionState, Connector, SqliteConnector};
pub use ingestion::{IngestionWorker, Tick, WorkerStats};
pub use pool::WorkerPool;
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
