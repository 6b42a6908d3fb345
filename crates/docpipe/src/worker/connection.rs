//! Store connection lifecycle owned by each worker slot.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::db::{Database, DatabaseError};

/// Opens a handle to the job store.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Database, DatabaseError>;

    /// Where this connector points, for logs.
    fn describe(&self) -> String;
}

/// Opens the SQLite file (running migrations) and confirms it answers.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for SqliteConnector {
    fn connect(&self) -> Result<Database, DatabaseError> {
        let db = Database::open(&self.path)?;
        db.ping()?;
        Ok(db)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Whether a slot currently holds a usable store handle. Polling is
/// suspended while disconnected.
pub enum ConnectionState {
    Disconnected {
        last_attempt: Option<Instant>,
        failures: u32,
    },
    Connected(Database),
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected {
            last_attempt: None,
            failures: 0,
        }
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    pub fn database(&self) -> Option<&Database> {
        match self {
            ConnectionState::Connected(db) => Some(db),
            ConnectionState::Disconnected { .. } => None,
        }
    }

    /// Attempts to connect if disconnected and at least `interval` has
    /// passed since the last attempt. Returns `true` only on the attempt
    /// that actually (re)connected.
    pub fn try_connect(&mut self, connector: &dyn Connector, interval: Duration) -> bool {
        let failures = match self {
            ConnectionState::Connected(_) => return false,
            ConnectionState::Disconnected {
                last_attempt: Some(at),
                ..
            } if at.elapsed() < interval => return false,
            ConnectionState::Disconnected { failures, .. } => *failures,
        };

        match connector.connect() {
            Ok(db) => {
                info!("Connected to job store at {}", connector.describe());
                *self = ConnectionState::Connected(db);
                true
            }
            Err(e) => {
                warn!(
                    "Job store at {} unavailable (attempt {}): {}",
                    connector.describe(),
                    failures + 1,
                    e
                );
                *self = ConnectionState::Disconnected {
                    last_attempt: Some(Instant::now()),
                    failures: failures + 1,
                };
                false
            }
        }
    }

    /// Drops the handle after a connectivity failure. The next reconnect
    /// attempt waits a full interval.
    pub fn disconnect(&mut self, reason: &dyn fmt::Display) {
        if self.is_connected() {
            warn!("Lost job store connection, suspending polling: {}", reason);
        }
        *self = ConnectionState::Disconnected {
            last_attempt: Some(Instant::now()),
            failures: 0,
        };
    }
}
