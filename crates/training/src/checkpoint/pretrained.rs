use std::{collections::HashMap, fs, path::Path};

use candle_core::{Device, Tensor, Var};
use safetensors::SafeTensors;
use tracing::{info, warn};

use super::{check_shape, view_to_tensor, MODEL_PREFIX};
use crate::{error::to_runtime_error, TrainingError};

/// Outcome of a non-strict weight load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PretrainedReport {
    pub loaded: usize,
    /// Live parameters the file does not provide; they keep their values.
    pub missing: Vec<String>,
    /// File tensors with no live counterpart; they are ignored.
    pub unexpected: Vec<String>,
}

/// Copies matching weights from a deployment or resumable file into the live
/// parameters. Names may carry the `model.` prefix used by resumable files;
/// optimizer tensors are skipped. Missing and unexpected keys only warn, a
/// shape mismatch fails before any parameter is touched.
pub fn load_pretrained(
    path: &Path,
    parameters: &[(String, Var)],
) -> Result<PretrainedReport, TrainingError> {
    let bytes =
        fs::read(path).map_err(|err| TrainingError::corrupt(path, format!("unreadable: {err}")))?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|err| TrainingError::corrupt(path, err.to_string()))?;

    let live: HashMap<&str, &Var> = parameters
        .iter()
        .map(|(name, var)| (name.as_str(), var))
        .collect();

    let mut report = PretrainedReport::default();
    let mut staged: Vec<(&Var, Tensor)> = Vec::new();
    let mut stored_names: Vec<String> = Vec::new();
    for (stored, view) in tensors.tensors() {
        if stored.starts_with("optimizer.") {
            continue;
        }
        let name = stored.strip_prefix(MODEL_PREFIX).unwrap_or(stored.as_str()).to_string();
        match live.get(name.as_str()).copied() {
            Some(var) => {
                let target = var.as_tensor();
                check_shape(path, &name, view.shape(), target.dims())?;
                let tensor = view_to_tensor(path, &view, &Device::Cpu)?
                    .to_dtype(target.dtype())
                    .and_then(|t| t.to_device(target.device()))
                    .map_err(to_runtime_error)?;
                staged.push((var, tensor));
            }
            None => report.unexpected.push(stored.clone()),
        }
        stored_names.push(name);
    }

    for (name, _) in parameters {
        if !stored_names.iter().any(|stored| stored == name) {
            report.missing.push(name.clone());
        }
    }

    for (var, tensor) in staged {
        var.set(&tensor).map_err(to_runtime_error)?;
        report.loaded += 1;
    }

    report.missing.sort();
    report.unexpected.sort();
    if !report.missing.is_empty() {
        warn!(path = %path.display(), keys = ?report.missing, "pretrained weights missing keys");
    }
    if !report.unexpected.is_empty() {
        warn!(path = %path.display(), keys = ?report.unexpected, "pretrained weights have unexpected keys");
    }
    info!(path = %path.display(), loaded = report.loaded, "loaded pretrained weights");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{export_deployment, ExportRequest, Role};
    use candle_core::DType;
    use tempfile::tempdir;

    fn var(values: &[f32]) -> Var {
        Var::from_slice(values, values.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn tolerates_missing_and_extra_keys() {
        let dir = tempdir().unwrap();
        let stored = vec![
            ("enc_p.proj.weight".to_string(), Tensor::new(&[1.0f32, 2.0], &Device::Cpu).unwrap()),
            ("legacy.unused".to_string(), Tensor::new(&[3.0f32], &Device::Cpu).unwrap()),
        ];
        let outcome = export_deployment(
            dir.path(),
            ExportRequest {
                role: Role::Generator,
                epoch: 1,
                global_step: 1,
                experiment: "base",
                tensors: &stored,
                config: &serde_json::Value::Null,
            },
        )
        .unwrap();

        let live = vec![
            ("enc_p.proj.weight".to_string(), var(&[0.0, 0.0])),
            ("dec.new_layer".to_string(), var(&[7.0])),
        ];
        let report = load_pretrained(&outcome.path, &live).unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.missing, vec!["dec.new_layer".to_string()]);
        assert_eq!(report.unexpected, vec!["legacy.unused".to_string()]);

        assert_eq!(live[0].1.as_tensor().dtype(), DType::F32);
        assert_eq!(live[0].1.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(live[1].1.as_tensor().to_vec1::<f32>().unwrap(), vec![7.0]);
    }

    #[test]
    fn shape_mismatch_leaves_parameters_untouched() {
        let dir = tempdir().unwrap();
        let stored = vec![
            ("a".to_string(), Tensor::new(&[1.0f32], &Device::Cpu).unwrap()),
            ("b".to_string(), Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap()),
        ];
        let outcome = export_deployment(
            dir.path(),
            ExportRequest {
                role: Role::Discriminator,
                epoch: 1,
                global_step: 1,
                experiment: "base",
                tensors: &stored,
                config: &serde_json::Value::Null,
            },
        )
        .unwrap();

        let live = vec![("a".to_string(), var(&[0.0])), ("b".to_string(), var(&[0.0, 0.0]))];
        let err = load_pretrained(&outcome.path, &live).unwrap_err();
        assert!(err.is_recoverable_load_failure());
        assert_eq!(live[0].1.as_tensor().to_vec1::<f32>().unwrap(), vec![0.0]);
    }
}
