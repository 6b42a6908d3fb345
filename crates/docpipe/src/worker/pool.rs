use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info};

use crate::audit::Auditor;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::pipeline::Pipeline;

use super::connection::Connector;
use super::ingestion::{IngestionWorker, WorkerStats};
use super::shutdown::ShutdownSignal;

/// A fixed set of worker slots sharing one pipeline. Each slot has its own
/// store connection and runs one job at a time.
pub struct WorkerPool {
    workers: Vec<JoinHandle<WorkerStats>>,
}

impl WorkerPool {
    pub fn start(
        config: WorkerConfig,
        pipeline: Arc<Pipeline>,
        connector: Arc<dyn Connector>,
        auditor: Auditor,
        shutdown: ShutdownSignal,
    ) -> Result<Self, WorkerError> {
        let slots = config.slots.max(1);
        let mut workers = Vec::with_capacity(slots);

        for slot in 0..slots {
            let worker = IngestionWorker::new(
                slot,
                config.clone(),
                Arc::clone(&pipeline),
                Arc::clone(&connector),
                auditor.clone(),
            );
            let signal = shutdown.clone();

            let handle = thread::Builder::new()
                .name(format!("docpipe-worker-{}", slot))
                .spawn(move || worker.run(signal))
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

            workers.push(handle);
        }

        info!(
            "Started {} worker slot(s) against {}",
            slots,
            connector.describe()
        );

        Ok(Self { workers })
    }

    pub fn slots(&self) -> usize {
        self.workers.len()
    }

    /// Blocks until every slot has exited (after shutdown is triggered)
    /// and returns the combined counters.
    pub fn wait(self) -> WorkerStats {
        let mut total = WorkerStats::default();

        for (slot, worker) in self.workers.into_iter().enumerate() {
            match worker.join() {
                Ok(stats) => {
                    debug!("Worker slot {} finished: {:?}", slot, stats);
                    total.merge(&stats);
                }
                Err(e) => {
                    error!("{}: {:?}", WorkerError::Panicked { slot }, e);
                }
            }
        }

        info!(
            "All workers stopped: {} completed, {} retried, {} dead, {} released, {} reclaimed",
            total.completed, total.retried, total.dead, total.released, total.reclaimed
        );
        total
    }
}
