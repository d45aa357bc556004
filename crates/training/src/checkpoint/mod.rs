//! Resumable checkpoints: one safetensors file per role and save event.
//!
//! File layout:
//! - `model.<name>`: parameter values in f32
//! - `optimizer.exp_avg.<name>`, `optimizer.exp_avg_sq.<name>`: AdamW moments
//! - `optimizer.master.<name>`: fp32 master copies, when the optimizer keeps them
//! - metadata key `manifest`: JSON [`CheckpointManifest`]

use std::{
    collections::HashMap,
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use candle_core::{DType, Device, Tensor, Var};
use hex::encode as hex_encode;
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{
    config::RetentionMode,
    error::to_runtime_error,
    optimizer::{GradientScalerState, OptimizerState, ParameterState, TrainerOptimizer},
    TrainingConfig, TrainingError,
};

pub mod export;
pub mod policy;
pub mod pretrained;

pub use export::{
    deployment_file_name, export_deployment, export_resumable, DeploymentManifest, ExportOutcome,
    ExportRequest,
};
pub use policy::{EpochCheckpointPolicy, ExportTarget, PersistOutcome};
pub use pretrained::{load_pretrained, PretrainedReport};

pub const CHECKPOINT_VERSION: u32 = 1;
/// Fixed step number used by keep-latest mode so each save replaces the last.
pub const LATEST_SENTINEL: u64 = 233_333_333_333;
pub(crate) const MANIFEST_KEY: &str = "manifest";
pub(crate) const FILE_EXTENSION: &str = "safetensors";
const MODEL_PREFIX: &str = "model.";
const EXP_AVG_PREFIX: &str = "optimizer.exp_avg.";
const EXP_AVG_SQ_PREFIX: &str = "optimizer.exp_avg_sq.";
const MASTER_PREFIX: &str = "optimizer.master.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Generator,
    Discriminator,
    /// Text-to-semantic language model trained by the companion stage.
    Semantic,
}

impl Role {
    pub fn prefix(self) -> &'static str {
        match self {
            Role::Generator => "G",
            Role::Discriminator => "D",
            Role::Semantic => "T2S",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "G" => Some(Role::Generator),
            "D" => Some(Role::Discriminator),
            "T2S" => Some(Role::Semantic),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A resumable file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointId {
    pub role: Role,
    pub number: u64,
    pub path: PathBuf,
}

impl CheckpointId {
    /// Parses `<prefix>_<digits>.safetensors`.
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(FILE_EXTENSION)?.strip_suffix('.')?;
        let (prefix, digits) = stem.split_once('_')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            role: Role::from_prefix(prefix)?,
            number: digits.parse().ok()?,
            path: path.to_path_buf(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub format: String,
    pub version: u32,
    pub role: Role,
    pub epoch: usize,
    pub global_step: u64,
    pub optimizer_step: usize,
    pub learning_rate: f64,
    pub config_sha256: String,
    pub config: serde_json::Value,
    pub scaler: Option<GradientScalerState>,
}

pub struct SaveRequest<'a> {
    pub role: Role,
    pub epoch: usize,
    pub global_step: u64,
    pub parameters: &'a [(String, Var)],
    pub optimizer: &'a TrainerOptimizer,
    pub scaler: Option<GradientScalerState>,
    pub config: &'a TrainingConfig,
}

/// Validated contents of a resumable file, not yet applied to a model.
#[derive(Debug)]
pub struct CheckpointRecord {
    pub id: CheckpointId,
    pub manifest: CheckpointManifest,
    pub weights: Vec<(String, Tensor)>,
    pub optimizer: OptimizerState,
}

impl CheckpointRecord {
    pub fn epoch(&self) -> usize {
        self.manifest.epoch
    }

    /// Writes weights into the live parameters and restores optimizer moments.
    pub fn apply(
        self,
        parameters: &[(String, Var)],
        optimizer: &mut TrainerOptimizer,
    ) -> Result<(), TrainingError> {
        let by_name: HashMap<&str, &Var> = parameters
            .iter()
            .map(|(name, var)| (name.as_str(), var))
            .collect();
        for (name, tensor) in &self.weights {
            let var = by_name.get(name.as_str()).ok_or_else(|| {
                TrainingError::corrupt(&self.id.path, format!("unknown parameter {name}"))
            })?;
            let tensor = tensor
                .to_dtype(var.as_tensor().dtype())
                .map_err(to_runtime_error)?;
            var.set(&tensor).map_err(to_runtime_error)?;
        }
        optimizer.load_state(self.optimizer)
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    directory: PathBuf,
    retention: RetentionMode,
}

impl CheckpointStore {
    pub fn new(directory: impl Into<PathBuf>, retention: RetentionMode) -> Self {
        Self {
            directory: directory.into(),
            retention,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn retention(&self) -> RetentionMode {
        self.retention
    }

    /// Resumable files for `role`, ascending by step number. A missing
    /// directory holds no checkpoints.
    pub fn list(&self, role: Role) -> Result<Vec<CheckpointId>, TrainingError> {
        if !self.directory.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.directory).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to read checkpoint directory {}: {err}",
                self.directory.display()
            ))
        })?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                TrainingError::runtime(format!("failed to read checkpoint entry: {err}"))
            })?;
            if !entry.file_type().map(|ty| ty.is_file()).unwrap_or(false) {
                continue;
            }
            if let Some(id) = CheckpointId::parse(&entry.path()) {
                if id.role == role {
                    ids.push(id);
                }
            }
        }
        ids.sort_by_key(|id| id.number);
        Ok(ids)
    }

    pub fn find_latest(&self, role: Role) -> Result<Option<CheckpointId>, TrainingError> {
        Ok(self.list(role)?.pop())
    }

    /// Reads and validates `id` against the live parameter shapes. Any
    /// mismatch or unreadable content is a [`TrainingError::CorruptCheckpoint`].
    pub fn load(
        &self,
        id: &CheckpointId,
        parameters: &[(String, Var)],
    ) -> Result<CheckpointRecord, TrainingError> {
        let path = &id.path;
        let bytes =
            fs::read(path).map_err(|err| TrainingError::corrupt(path, format!("unreadable: {err}")))?;
        let manifest = read_manifest::<CheckpointManifest>(path, &bytes)?;
        if manifest.format != "resumable" || manifest.version != CHECKPOINT_VERSION {
            return Err(TrainingError::corrupt(
                path,
                format!(
                    "unsupported format {} v{} (expected resumable v{})",
                    manifest.format, manifest.version, CHECKPOINT_VERSION
                ),
            ));
        }
        if manifest.role != id.role {
            return Err(TrainingError::corrupt(
                path,
                format!("file holds role {} but is named for {}", manifest.role, id.role),
            ));
        }

        let tensors = SafeTensors::deserialize(&bytes)
            .map_err(|err| TrainingError::corrupt(path, err.to_string()))?;

        let model_keys = tensors
            .names()
            .into_iter()
            .filter(|name| name.starts_with(MODEL_PREFIX))
            .count();
        if model_keys != parameters.len() {
            return Err(TrainingError::corrupt(
                path,
                format!(
                    "stores {model_keys} parameters but the model has {}",
                    parameters.len()
                ),
            ));
        }

        let mut weights = Vec::with_capacity(parameters.len());
        let mut moments = Vec::with_capacity(parameters.len());
        for (name, var) in parameters {
            let live_shape = var.as_tensor().dims();
            let model = required_view(&tensors, path, &format!("{MODEL_PREFIX}{name}"), live_shape)?;
            let exp_avg = required_view(&tensors, path, &format!("{EXP_AVG_PREFIX}{name}"), live_shape)?;
            let exp_avg_sq =
                required_view(&tensors, path, &format!("{EXP_AVG_SQ_PREFIX}{name}"), live_shape)?;
            let master = match tensors.tensor(&format!("{MASTER_PREFIX}{name}")) {
                Ok(view) => {
                    check_shape(path, name, view.shape(), live_shape)?;
                    Some(view_to_f32(path, &view)?)
                }
                Err(_) => None,
            };

            weights.push((name.clone(), view_to_tensor(path, &model, &Device::Cpu)?));
            moments.push(ParameterState {
                name: name.clone(),
                shape: live_shape.to_vec(),
                first_moment: view_to_f32(path, &exp_avg)?,
                second_moment: view_to_f32(path, &exp_avg_sq)?,
                master,
            });
        }

        debug!(path = %path.display(), epoch = manifest.epoch, "validated checkpoint");
        let optimizer = OptimizerState {
            step: manifest.optimizer_step,
            parameters: moments,
        };
        Ok(CheckpointRecord {
            id: id.clone(),
            manifest,
            weights,
            optimizer,
        })
    }

    /// Writes the record to a temp file in the checkpoint directory, syncs it
    /// and renames it into place. A failure never touches existing files.
    pub fn save_resumable(&self, request: SaveRequest<'_>) -> Result<CheckpointId, TrainingError> {
        let number = match self.retention {
            RetentionMode::LatestOnly => LATEST_SENTINEL,
            RetentionMode::All => request.global_step,
        };
        let path = self.directory.join(format!(
            "{}_{}.{}",
            request.role.prefix(),
            number,
            FILE_EXTENSION
        ));

        if request.parameters.is_empty() {
            return Err(TrainingError::write(&path, "model contains no parameters"));
        }

        let optimizer_state = request
            .optimizer
            .state()
            .map_err(|err| TrainingError::write(&path, err.to_string()))?;
        let manifest = CheckpointManifest {
            format: "resumable".to_string(),
            version: CHECKPOINT_VERSION,
            role: request.role,
            epoch: request.epoch,
            global_step: request.global_step,
            optimizer_step: optimizer_state.step,
            learning_rate: request.optimizer.learning_rate(),
            config_sha256: fingerprint_config(request.config)?,
            config: serde_json::to_value(request.config)?,
            scaler: request.scaler,
        };

        let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        for (name, var) in request.parameters {
            let tensor = var.as_tensor();
            buffers.push((
                format!("{MODEL_PREFIX}{name}"),
                tensor.dims().to_vec(),
                f32_le_bytes(&tensor_to_f32(tensor)?),
            ));
        }
        for state in &optimizer_state.parameters {
            buffers.push((
                format!("{EXP_AVG_PREFIX}{}", state.name),
                state.shape.clone(),
                f32_le_bytes(&state.first_moment),
            ));
            buffers.push((
                format!("{EXP_AVG_SQ_PREFIX}{}", state.name),
                state.shape.clone(),
                f32_le_bytes(&state.second_moment),
            ));
            if let Some(master) = &state.master {
                buffers.push((
                    format!("{MASTER_PREFIX}{}", state.name),
                    state.shape.clone(),
                    f32_le_bytes(master),
                ));
            }
        }

        let bytes = serialize_views(&path, Dtype::F32, &buffers, &manifest)?;
        match self.retention {
            RetentionMode::LatestOnly => write_atomic(&path, &bytes)?,
            // Step-numbered files are never rewritten; a collision means the
            // step count went backwards since that file was saved.
            RetentionMode::All => write_atomic_new(&path, &bytes)?,
        }
        info!(
            role = %request.role,
            epoch = request.epoch,
            global_step = request.global_step,
            path = %path.display(),
            "saved resumable checkpoint"
        );

        Ok(CheckpointId {
            role: request.role,
            number,
            path,
        })
    }

    /// In keep-latest mode deletes every other resumable file of `role`.
    /// The listing is taken after `keep` is on disk, so a failed save never
    /// reaches this point with stale deletions staged.
    pub fn apply_retention(
        &self,
        role: Role,
        keep: &CheckpointId,
    ) -> Result<Vec<PathBuf>, TrainingError> {
        if self.retention == RetentionMode::All {
            return Ok(Vec::new());
        }
        if keep.role != role || !keep.path.is_file() {
            return Err(TrainingError::runtime(format!(
                "refusing retention for {role}: {} is not a durable checkpoint",
                keep.path.display()
            )));
        }

        let mut removed = Vec::new();
        for id in self.list(role)? {
            if id.path == keep.path {
                continue;
            }
            fs::remove_file(&id.path).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to prune checkpoint {}: {err}",
                    id.path.display()
                ))
            })?;
            debug!(path = %id.path.display(), "pruned checkpoint");
            removed.push(id.path);
        }
        Ok(removed)
    }
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

/// Manifest metadata of any checkpoint or deployment file.
pub fn read_manifest<T: for<'de> Deserialize<'de>>(
    path: &Path,
    bytes: &[u8],
) -> Result<T, TrainingError> {
    let (_, metadata) = SafeTensors::read_metadata(bytes)
        .map_err(|err| TrainingError::corrupt(path, err.to_string()))?;
    let raw = metadata
        .metadata()
        .as_ref()
        .and_then(|entries| entries.get(MANIFEST_KEY))
        .ok_or_else(|| TrainingError::corrupt(path, "missing manifest metadata"))?;
    serde_json::from_str(raw)
        .map_err(|err| TrainingError::corrupt(path, format!("invalid manifest: {err}")))
}

pub(crate) fn serialize_views<M: Serialize>(
    path: &Path,
    dtype: Dtype,
    buffers: &[(String, Vec<usize>, Vec<u8>)],
    manifest: &M,
) -> Result<Vec<u8>, TrainingError> {
    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in buffers {
        let view = TensorView::new(dtype, shape.clone(), bytes)
            .map_err(|err| TrainingError::write(path, format!("tensor {name}: {err}")))?;
        views.push((name.as_str(), view));
    }
    let mut metadata = HashMap::new();
    metadata.insert(
        MANIFEST_KEY.to_string(),
        serde_json::to_string(manifest)
            .map_err(|err| TrainingError::write(path, format!("manifest: {err}")))?,
    );
    safetensors::serialize(views, &Some(metadata))
        .map_err(|err| TrainingError::write(path, err.to_string()))
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TrainingError> {
    stage(path, bytes)?
        .persist(path)
        .map_err(|err| TrainingError::write(path, err.error.to_string()))?;
    Ok(())
}

/// Like [`write_atomic`] but fails instead of replacing an existing file.
pub(crate) fn write_atomic_new(path: &Path, bytes: &[u8]) -> Result<(), TrainingError> {
    stage(path, bytes)?
        .persist_noclobber(path)
        .map_err(|err| match err.error.kind() {
            io::ErrorKind::AlreadyExists => {
                TrainingError::write(path, "refusing to overwrite an existing checkpoint")
            }
            _ => TrainingError::write(path, err.error.to_string()),
        })?;
    Ok(())
}

/// Synced temp file next to `path`, ready to be renamed into place.
fn stage(path: &Path, bytes: &[u8]) -> Result<tempfile::NamedTempFile, TrainingError> {
    let directory = path
        .parent()
        .ok_or_else(|| TrainingError::write(path, "path has no parent directory"))?;
    fs::create_dir_all(directory).map_err(|err| TrainingError::write(path, err.to_string()))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TrainingError::write(path, "file name is not valid UTF-8"))?;
    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".partial")
        .tempfile_in(directory)
        .map_err(|err| TrainingError::write(path, err.to_string()))?;
    temp.write_all(bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| TrainingError::write(path, err.to_string()))?;
    Ok(temp)
}

pub(crate) fn tensor_to_f32(tensor: &Tensor) -> Result<Vec<f32>, TrainingError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)
}

pub(crate) fn f32_le_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

pub(crate) fn view_to_tensor(
    path: &Path,
    view: &TensorView<'_>,
    device: &Device,
) -> Result<Tensor, TrainingError> {
    let dtype = match view.dtype() {
        Dtype::F32 => DType::F32,
        Dtype::F16 => DType::F16,
        Dtype::BF16 => DType::BF16,
        Dtype::F64 => DType::F64,
        other => {
            return Err(TrainingError::corrupt(
                path,
                format!("unsupported tensor dtype {other:?}"),
            ))
        }
    };
    Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)
        .map_err(|err| TrainingError::corrupt(path, err.to_string()))
}

fn view_to_f32(path: &Path, view: &TensorView<'_>) -> Result<Vec<f32>, TrainingError> {
    tensor_to_f32(&view_to_tensor(path, view, &Device::Cpu)?)
}

fn required_view<'data>(
    tensors: &SafeTensors<'data>,
    path: &Path,
    key: &str,
    live_shape: &[usize],
) -> Result<TensorView<'data>, TrainingError> {
    let view = tensors
        .tensor(key)
        .map_err(|_| TrainingError::corrupt(path, format!("missing tensor {key}")))?;
    check_shape(path, key, view.shape(), live_shape)?;
    Ok(view)
}

pub(crate) fn check_shape(
    path: &Path,
    name: &str,
    stored: &[usize],
    live: &[usize],
) -> Result<(), TrainingError> {
    if stored != live {
        return Err(TrainingError::corrupt(
            path,
            format!("shape mismatch for {name}: stored {stored:?}, model {live:?}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        optimizer::{AdamWConfig, OptimizerConfig, TrainerOptimizerOptions},
        params::ParameterPartition,
    };
    use tempfile::tempdir;

    fn config(dir: &Path) -> TrainingConfig {
        toml::from_str(&format!(
            "[train]\ncheckpoint_dir = {:?}\nprecision = \"fp32\"\n",
            dir.display().to_string()
        ))
        .unwrap()
    }

    fn params(shape: (usize, usize), fill: f32) -> Vec<(String, Var)> {
        let weight = Var::from_tensor(
            &Tensor::full(fill, shape, &Device::Cpu).unwrap(),
        )
        .unwrap();
        let bias = Var::zeros(shape.0, DType::F32, &Device::Cpu).unwrap();
        vec![("dec.weight".to_string(), weight), ("dec.bias".to_string(), bias)]
    }

    fn optimizer(parameters: &[(String, Var)]) -> TrainerOptimizer {
        TrainerOptimizer::new(
            ParameterPartition::uniform(parameters.to_vec()).unwrap(),
            OptimizerConfig::AdamW(AdamWConfig {
                learning_rate: 1e-3,
                beta1: 0.8,
                beta2: 0.99,
                epsilon: 1e-9,
                weight_decay: 0.0,
            }),
            TrainerOptimizerOptions::default(),
        )
        .unwrap()
    }

    fn save(store: &CheckpointStore, cfg: &TrainingConfig, parameters: &[(String, Var)], step: u64) -> CheckpointId {
        let optimizer = optimizer(parameters);
        let id = store
            .save_resumable(SaveRequest {
                role: Role::Generator,
                epoch: step as usize,
                global_step: step,
                parameters,
                optimizer: &optimizer,
                scaler: None,
                config: cfg,
            })
            .unwrap();
        store.apply_retention(Role::Generator, &id).unwrap();
        id
    }

    #[test]
    fn parses_only_well_formed_names() {
        assert_eq!(
            CheckpointId::parse(Path::new("/x/G_1200.safetensors")).map(|id| id.number),
            Some(1200)
        );
        assert_eq!(
            CheckpointId::parse(Path::new("T2S_7.safetensors")).map(|id| id.role),
            Some(Role::Semantic)
        );
        for name in [".G_1.safetensors.abc.partial", "G_.safetensors", "G_12a.safetensors", "X_1.safetensors", "G_1.pth"] {
            assert!(CheckpointId::parse(Path::new(name)).is_none(), "{name}");
        }
    }

    #[test]
    fn find_latest_on_missing_or_empty_directory() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("absent"), RetentionMode::All);
        assert!(store.find_latest(Role::Generator).unwrap().is_none());

        let store = CheckpointStore::new(dir.path(), RetentionMode::All);
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert!(store.find_latest(Role::Generator).unwrap().is_none());
    }

    #[test]
    fn keep_all_accumulates_and_sorts_numerically() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let store = CheckpointStore::new(dir.path(), RetentionMode::All);
        let parameters = params((2, 3), 0.5);
        for step in [9, 10, 100] {
            save(&store, &cfg, &parameters, step);
        }
        assert_eq!(store.list(Role::Generator).unwrap().len(), 3);
        assert_eq!(store.find_latest(Role::Generator).unwrap().unwrap().number, 100);
    }

    #[test]
    fn keep_all_never_rewrites_a_step_file() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let store = CheckpointStore::new(dir.path(), RetentionMode::All);
        let id = save(&store, &cfg, &params((2, 3), 1.0), 10);
        let before = fs::read(&id.path).unwrap();

        let parameters = params((2, 3), 2.0);
        let optimizer = optimizer(&parameters);
        let err = store
            .save_resumable(SaveRequest {
                role: Role::Generator,
                epoch: 3,
                global_step: 10,
                parameters: &parameters,
                optimizer: &optimizer,
                scaler: None,
                config: &cfg,
            })
            .unwrap_err();
        assert!(matches!(err, TrainingError::CheckpointWrite { .. }), "{err}");
        assert_eq!(fs::read(&id.path).unwrap(), before);
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["G_10.safetensors".to_string()]);
    }

    #[test]
    fn latest_only_keeps_a_single_file() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        // Leftovers from an earlier keep-all run.
        let leftovers = CheckpointStore::new(dir.path(), RetentionMode::All);
        let parameters = params((2, 3), 0.5);
        save(&leftovers, &cfg, &parameters, 4);

        let store = CheckpointStore::new(dir.path(), RetentionMode::LatestOnly);
        for step in 0..3 {
            let id = save(&store, &cfg, &parameters, step);
            assert_eq!(id.number, LATEST_SENTINEL);
            assert_eq!(store.list(Role::Generator).unwrap(), vec![id]);
        }
        let leftover_temp = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_name().to_string_lossy().ends_with(".partial"));
        assert!(!leftover_temp);
    }

    #[test]
    fn load_round_trips_weights_and_manifest() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let store = CheckpointStore::new(dir.path(), RetentionMode::All);
        let saved = params((2, 3), 0.25);
        let id = save(&store, &cfg, &saved, 42);

        let live = params((2, 3), 0.0);
        let mut live_optimizer = optimizer(&live);
        let record = store.load(&id, &live).unwrap();
        assert_eq!(record.epoch(), 42);
        assert_eq!(record.manifest.global_step, 42);
        assert_eq!(record.manifest.config_sha256, fingerprint_config(&cfg).unwrap());
        record.apply(&live, &mut live_optimizer).unwrap();

        let values = live[0].1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![0.25; 6]);
    }

    #[test]
    fn shape_mismatch_is_corrupt() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let store = CheckpointStore::new(dir.path(), RetentionMode::All);
        let id = save(&store, &cfg, &params((2, 3), 1.0), 1);

        let err = store.load(&id, &params((3, 3), 1.0)).unwrap_err();
        assert!(err.is_recoverable_load_failure(), "{err}");
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let store = CheckpointStore::new(dir.path(), RetentionMode::All);
        let id = save(&store, &cfg, &params((2, 3), 1.0), 1);
        let bytes = fs::read(&id.path).unwrap();
        fs::write(&id.path, &bytes[..bytes.len() / 2]).unwrap();

        let err = store.load(&id, &params((2, 3), 1.0)).unwrap_err();
        assert!(err.is_recoverable_load_failure(), "{err}");
    }

    #[test]
    fn failed_save_keeps_previous_checkpoint() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let store = CheckpointStore::new(dir.path(), RetentionMode::LatestOnly);
        let parameters = params((2, 3), 1.0);
        let id = save(&store, &cfg, &parameters, 1);
        let before = fs::read(&id.path).unwrap();

        let optimizer = optimizer(&parameters);
        let err = store
            .save_resumable(SaveRequest {
                role: Role::Generator,
                epoch: 2,
                global_step: 2,
                parameters: &[],
                optimizer: &optimizer,
                scaler: None,
                config: &cfg,
            })
            .unwrap_err();
        assert!(matches!(err, TrainingError::CheckpointWrite { .. }));
        assert_eq!(fs::read(&id.path).unwrap(), before);
    }
}
