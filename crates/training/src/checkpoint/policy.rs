use std::path::PathBuf;

use candle_core::{Tensor, Var};
use tracing::{debug, warn};

use super::{
    export_deployment, CheckpointId, CheckpointStore, ExportOutcome, ExportRequest, Role,
    SaveRequest,
};
use crate::{
    config::{RetentionMode, TrainConfig},
    TrainingError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTarget {
    pub directory: PathBuf,
    pub experiment: String,
}

/// When to save at epoch end and what to do around each save.
#[derive(Debug, Clone)]
pub struct EpochCheckpointPolicy {
    every_n_epochs: usize,
    retention: RetentionMode,
    export: Option<ExportTarget>,
}

#[derive(Debug, Clone)]
pub struct PersistOutcome {
    pub id: CheckpointId,
    pub removed: Vec<PathBuf>,
}

impl EpochCheckpointPolicy {
    pub fn new(every_n_epochs: usize, retention: RetentionMode, export: Option<ExportTarget>) -> Self {
        Self {
            every_n_epochs: every_n_epochs.max(1),
            retention,
            export,
        }
    }

    pub fn from_config(train: &TrainConfig) -> Self {
        let export = match (&train.deployment_dir, train.save_deployment_weights) {
            (Some(directory), true) => Some(ExportTarget {
                directory: directory.clone(),
                experiment: train.experiment_name.clone(),
            }),
            _ => None,
        };
        Self::new(train.save_every_n_epochs, train.retention, export)
    }

    pub fn store(&self, directory: impl Into<PathBuf>) -> CheckpointStore {
        CheckpointStore::new(directory, self.retention)
    }

    /// `epoch` is 1-based.
    pub fn should_save(&self, epoch: usize) -> bool {
        epoch > 0 && epoch % self.every_n_epochs == 0
    }

    pub fn exports(&self) -> bool {
        self.export.is_some()
    }

    /// Saves a resumable file, then prunes older ones of the same role. A
    /// failed write returns before anything is deleted.
    pub fn persist(
        &self,
        store: &CheckpointStore,
        request: SaveRequest<'_>,
    ) -> Result<PersistOutcome, TrainingError> {
        let role = request.role;
        let id = store.save_resumable(request)?;
        let removed = match store.apply_retention(role, &id) {
            Ok(removed) => removed,
            Err(err) => {
                // The new file is durable; stale ones are retried next save.
                warn!(role = %role, error = %err, "checkpoint retention failed");
                Vec::new()
            }
        };
        if !removed.is_empty() {
            debug!(role = %role, removed = removed.len(), "applied checkpoint retention");
        }
        Ok(PersistOutcome { id, removed })
    }

    /// Deployment export of `parameters`, when enabled. Files are additive
    /// and never pruned here.
    pub fn export(
        &self,
        role: Role,
        epoch: usize,
        global_step: u64,
        parameters: &[(String, Var)],
        config: &serde_json::Value,
    ) -> Result<Option<ExportOutcome>, TrainingError> {
        let Some(target) = &self.export else {
            return Ok(None);
        };
        let tensors: Vec<(String, Tensor)> = parameters
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
            .collect();
        export_deployment(
            &target.directory,
            ExportRequest {
                role,
                epoch,
                global_step,
                experiment: &target.experiment,
                tensors: &tensors,
                config,
            },
        )
        .map(Some)
    }
}
