//! Inference-only weight files in half precision.

use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use half::f16;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    read_manifest, serialize_views, tensor_to_f32, view_to_tensor, write_atomic,
    CheckpointManifest, Role, CHECKPOINT_VERSION, FILE_EXTENSION, MODEL_PREFIX,
};
use crate::TrainingError;

pub struct ExportRequest<'a> {
    pub role: Role,
    pub epoch: usize,
    pub global_step: u64,
    pub experiment: &'a str,
    pub tensors: &'a [(String, Tensor)],
    /// Model hyperparameters recorded next to the weights.
    pub config: &'a serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentManifest {
    pub format: String,
    pub version: u32,
    pub role: Role,
    pub epoch: usize,
    pub global_step: u64,
    pub info: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub path: PathBuf,
    /// Tensors holding finite values that do not fit in f16.
    pub overflowed: Vec<String>,
}

/// `<experiment>_e<epoch>_s<step>` for the generator,
/// `<experiment>-e<epoch>` for the semantic model.
pub fn deployment_file_name(role: Role, experiment: &str, epoch: usize, global_step: u64) -> String {
    match role {
        Role::Semantic => format!("{experiment}-e{epoch}.{FILE_EXTENSION}"),
        Role::Generator | Role::Discriminator => {
            format!("{experiment}_e{epoch}_s{global_step}.{FILE_EXTENSION}")
        }
    }
}

/// Writes every tensor as f16 with a manifest. Identical inputs produce
/// byte-identical files, so re-exporting the same state is a no-op on disk.
pub fn export_deployment(
    directory: &Path,
    request: ExportRequest<'_>,
) -> Result<ExportOutcome, TrainingError> {
    let path = directory.join(deployment_file_name(
        request.role,
        request.experiment,
        request.epoch,
        request.global_step,
    ));
    if request.tensors.is_empty() {
        return Err(TrainingError::write(&path, "nothing to export"));
    }

    let mut overflowed = Vec::new();
    let mut buffers = Vec::with_capacity(request.tensors.len());
    for (name, tensor) in request.tensors {
        let values = tensor_to_f32(tensor)?;
        let mut bytes = Vec::with_capacity(values.len() * 2);
        let mut overflow = false;
        for value in values {
            let half = f16::from_f32(value);
            overflow |= value.is_finite() && half.is_infinite();
            bytes.extend_from_slice(&half.to_le_bytes());
        }
        if overflow {
            warn!(tensor = %name, "values exceed the f16 range and were saturated to infinity");
            overflowed.push(name.clone());
        }
        buffers.push((name.clone(), tensor.dims().to_vec(), bytes));
    }

    let manifest = DeploymentManifest {
        format: "deployment".to_string(),
        version: CHECKPOINT_VERSION,
        role: request.role,
        epoch: request.epoch,
        global_step: request.global_step,
        info: match request.role {
            Role::Semantic => format!("GPT-e{}", request.epoch),
            Role::Generator | Role::Discriminator => {
                format!("{}epoch_{}iteration", request.epoch, request.global_step)
            }
        },
        config: request.config.clone(),
    };

    let bytes = serialize_views(&path, Dtype::F16, &buffers, &manifest)?;
    write_atomic(&path, &bytes)?;
    info!(
        role = %request.role,
        epoch = request.epoch,
        path = %path.display(),
        "exported deployment weights"
    );
    Ok(ExportOutcome { path, overflowed })
}

/// Deployment export straight from a resumable file, using its recorded
/// epoch, step and run configuration.
pub fn export_resumable(
    checkpoint: &Path,
    directory: &Path,
    experiment: &str,
) -> Result<ExportOutcome, TrainingError> {
    let bytes = fs::read(checkpoint)
        .map_err(|err| TrainingError::corrupt(checkpoint, format!("unreadable: {err}")))?;
    let manifest: CheckpointManifest = read_manifest(checkpoint, &bytes)?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|err| TrainingError::corrupt(checkpoint, err.to_string()))?;

    let mut weights = Vec::new();
    for (name, view) in tensors.tensors() {
        if let Some(parameter) = name.strip_prefix(MODEL_PREFIX) {
            weights.push((
                parameter.to_string(),
                view_to_tensor(checkpoint, &view, &Device::Cpu)?,
            ));
        }
    }
    weights.sort_by(|a, b| a.0.cmp(&b.0));

    export_deployment(
        directory,
        ExportRequest {
            role: manifest.role,
            epoch: manifest.epoch,
            global_step: manifest.global_step,
            experiment,
            tensors: &weights,
            config: &manifest.config,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::read_manifest;
    use candle_core::Device;
    use safetensors::SafeTensors;
    use std::fs;
    use tempfile::tempdir;

    fn tensors(values: &[f32]) -> Vec<(String, Tensor)> {
        vec![(
            "dec.conv.weight".to_string(),
            Tensor::from_slice(values, (1, values.len()), &Device::Cpu).unwrap(),
        )]
    }

    #[test]
    fn names_follow_role() {
        assert_eq!(
            deployment_file_name(Role::Generator, "voice", 8, 1200),
            "voice_e8_s1200.safetensors"
        );
        assert_eq!(deployment_file_name(Role::Semantic, "voice", 15, 0), "voice-e15.safetensors");
    }

    #[test]
    fn writes_half_precision_with_manifest() {
        let dir = tempdir().unwrap();
        let config = serde_json::json!({ "inter_channels": 192 });
        let outcome = export_deployment(
            dir.path(),
            ExportRequest {
                role: Role::Generator,
                epoch: 3,
                global_step: 30,
                experiment: "voice",
                tensors: &tensors(&[0.5, -1.25, 2.0]),
                config: &config,
            },
        )
        .unwrap();
        assert!(outcome.overflowed.is_empty());

        let bytes = fs::read(&outcome.path).unwrap();
        let loaded = SafeTensors::deserialize(&bytes).unwrap();
        let view = loaded.tensor("dec.conv.weight").unwrap();
        assert_eq!(view.dtype(), Dtype::F16);
        assert_eq!(view.shape(), &[1, 3]);

        let manifest: DeploymentManifest = read_manifest(&outcome.path, &bytes).unwrap();
        assert_eq!(manifest.info, "3epoch_30iteration");
        assert_eq!(manifest.config, config);
    }

    #[test]
    fn reports_f16_overflow() {
        let dir = tempdir().unwrap();
        let outcome = export_deployment(
            dir.path(),
            ExportRequest {
                role: Role::Generator,
                epoch: 1,
                global_step: 1,
                experiment: "voice",
                tensors: &tensors(&[1.0e6, 1.0]),
                config: &serde_json::Value::Null,
            },
        )
        .unwrap();
        assert_eq!(outcome.overflowed, vec!["dec.conv.weight".to_string()]);
    }
}
