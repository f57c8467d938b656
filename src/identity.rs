// Process identity blocks for both sides of the control protocol.
//
// The startup epoch is read exactly once at process init and is immutable
// afterwards; peers compare it across messages to detect restarts, so a
// process that re-reads the clock would defeat failure detection.

use crate::common::{millis_since_epoch, CoordinatorId, WorkerId};
use crate::config::{CoordinatorConfig, WorkerConfig};
use crate::proto::status::{CoordinatorContact, WorkerContact};

/// Identity of a running coordinator instance.
#[derive(Debug, Clone)]
pub struct CoordinatorIdentity {
    /// Stable id assigned by the metadata store at registration.
    pub id: CoordinatorId,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Millisecond timestamp taken once at process start.
    pub startup_epoch: u64,
}

impl CoordinatorIdentity {
    pub fn new(id: CoordinatorId, cfg: &CoordinatorConfig) -> Self {
        Self {
            id,
            name: cfg.name.clone(),
            host: cfg.host.clone(),
            port: cfg.port,
            startup_epoch: millis_since_epoch(),
        }
    }

    pub fn contact(&self) -> CoordinatorContact {
        CoordinatorContact {
            name: self.name.clone(),
            id: self.id,
            management_host: self.host.clone(),
            management_port: self.port,
            startup_epoch: self.startup_epoch,
        }
    }
}

/// Identity of a running worker instance.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub id: WorkerId,
    pub host: String,
    pub port: u16,
    pub startup_epoch: u64,
}

impl WorkerIdentity {
    pub fn new(cfg: &WorkerConfig) -> Self {
        Self {
            id: cfg.worker_id.clone(),
            host: cfg.host.clone(),
            port: cfg.port,
            startup_epoch: millis_since_epoch(),
        }
    }

    pub fn contact(&self) -> WorkerContact {
        WorkerContact {
            id: self.id.clone(),
            host: self.host.clone(),
            management_host: self.host.clone(),
            management_port: self.port,
            startup_epoch: self.startup_epoch,
        }
    }
}
