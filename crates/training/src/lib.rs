pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod scheduler;
pub mod shutdown;

pub use checkpoint::{
    export_deployment, load_pretrained, CheckpointId, CheckpointRecord, CheckpointStore,
    EpochCheckpointPolicy, ExportRequest, Role, SaveRequest,
};
pub use config::{Precision, RetentionMode, TrainingConfig};
pub use coordinator::{RecoveryPath, TrainingCoordinator, TrainingOutcome};
pub use data::{AudioBatch, BucketedBatchSource, Dataset, PlannedBatch, PrefetchLoader};
pub use distributed::{ComputeContext, LocalProcessGroup, ProcessGroup, SingleProcess};
pub use engine::{AdversarialStepEngine, OptimizationUnit, StepPhase, StepReport, TrainingState};
pub use error::TrainingError;
pub use logging::{MetricSink, NullSink, TensorBoardSink};
pub use loss::{AdversarialLoss, LeastSquaresLoss};
pub use model::{Discriminator, Generator, MelTransform, TrainableModule};
pub use optimizer::{GradientScaler, OptimizerConfig, OptimizerState, TrainerOptimizer};
pub use params::{ParameterGroup, ParameterPartition};
pub use scheduler::{ExponentialDecay, LRScheduler};
pub use shutdown::ShutdownSignal;
