//! Runtime Core - Foundation for the fine-tuning support runtime
//!
//! Provides the tensor and parameter model, the distributed context and its
//! collectives, seeding, device transfer, optimizer grouping, configuration
//! and error handling shared by the storage and checkpoint crates.

pub mod config;
pub mod device;
pub mod dist;
pub mod error;
pub mod model;
pub mod optim;
pub mod seed;
pub mod telemetry;
pub mod tensor;
pub mod types;

pub use config::{ExportArgs, ExportConfig, LoggingConfig, OptimizerConfig, TrainingConfig};
pub use device::{to_device, Batch, BatchValue};
pub use dist::{
    get_all_reduce_mean, CollectiveStats, DistributedContext, LocalProcessGroup, ProcessGroup,
};
pub use error::{Error, Result};
pub use model::{
    params_to_fetch, GatheredParameters, Model, ModelConfig, Module, ParamModule, ParamStorage,
    Parameter, PartitionStatus, ShardedTensor,
};
pub use optim::{get_optimizer_grouped_parameters, ParamGroup, DEFAULT_NO_DECAY_NAME_LIST};
pub use seed::{RngRegistry, SeedHook};
pub use telemetry::{init_tracing, print_rank_0};
pub use tensor::{Element, Tensor};
pub use types::*;
