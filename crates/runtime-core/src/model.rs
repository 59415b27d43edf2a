//! Model and parameter handles
//!
//! A training loop hands us either the bare module or the module wrapped by
//! the distributed engine ([`Model`]). Parameters are either fully resident
//! on this rank or partitioned across the group ([`ParamStorage`]); the
//! partitioned kind has to be gathered before its full value can be read.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{DType, Error, PartitionId, ProcessGroup, Result, Tensor};

/// Model configuration as the model hub stores it (`config.json`)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelConfig(pub serde_json::Map<String, serde_json::Value>);

impl ModelConfig {
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidConfig {
                message: format!("model config must be a JSON object, got {}", other),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Serialize with 2-space indent, sorted keys and a trailing newline
    pub fn to_json_string(&self) -> Result<String> {
        // serde_json's default map is ordered by key
        let mut json = serde_json::to_string_pretty(&self.0)?;
        json.push('\n');
        Ok(json)
    }
}

/// Anything that exposes named parameters the way a training module does
pub trait Module: Send + Sync {
    /// Parameters in registration order
    fn named_parameters(&self) -> Vec<(&str, &Parameter)>;

    /// Non-trainable state that is still part of the state dict
    fn named_buffers(&self) -> Vec<(&str, &Tensor)> {
        Vec::new()
    }

    fn config(&self) -> &ModelConfig;
}

/// A module as handed over by the training loop
#[derive(Clone)]
pub enum Model {
    Plain(Arc<dyn Module>),
    /// Wrapped by the distributed training engine
    Wrapped(Arc<dyn Module>),
}

impl Model {
    /// The inner module, with any engine wrapper removed
    pub fn unwrap(&self) -> &dyn Module {
        match self {
            Model::Plain(module) | Model::Wrapped(module) => module.as_ref(),
        }
    }

    pub fn is_wrapped(&self) -> bool {
        matches!(self, Model::Wrapped(_))
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_wrapped() { "Wrapped" } else { "Plain" };
        f.debug_struct("Model")
            .field("kind", &kind)
            .field("parameters", &self.unwrap().named_parameters().len())
            .finish()
    }
}

/// Availability of the full value of a partitioned parameter on this rank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    /// Only the local partition is resident
    NotAvailable,
    /// A gather is running
    InFlight,
    /// The full tensor is materialized
    Available,
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionStatus::NotAvailable => f.write_str("NOT_AVAILABLE"),
            PartitionStatus::InFlight => f.write_str("INFLIGHT"),
            PartitionStatus::Available => f.write_str("AVAILABLE"),
        }
    }
}

#[derive(Debug)]
struct PartitionState {
    status: PartitionStatus,
    full: Option<Tensor>,
}

/// A parameter split flat and evenly across the ranks of a group
///
/// The flattened tensor is padded with zeros to a multiple of the world size
/// and rank `r` keeps elements `[r * n, (r + 1) * n)`.
#[derive(Debug)]
pub struct ShardedTensor {
    partition_id: PartitionId,
    dtype: DType,
    full_shape: Vec<usize>,
    partition: Tensor,
    state: Mutex<PartitionState>,
}

impl ShardedTensor {
    /// Build from this rank's partition of a tensor of shape `full_shape`
    pub fn from_partition(
        partition_id: PartitionId,
        full_shape: &[usize],
        partition: Tensor,
    ) -> Self {
        Self {
            partition_id,
            dtype: partition.dtype().clone(),
            full_shape: full_shape.to_vec(),
            partition,
            state: Mutex::new(PartitionState {
                status: PartitionStatus::NotAvailable,
                full: None,
            }),
        }
    }

    /// Cut `rank`'s partition out of a full tensor
    pub fn partition(
        partition_id: PartitionId,
        full: &Tensor,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(Error::InvalidConfig {
                message: format!("rank {} outside world of size {}", rank, world_size),
            });
        }

        let numel = full.numel();
        let per_rank = numel.div_ceil(world_size);
        let start = (rank * per_rank).min(numel);
        let end = ((rank + 1) * per_rank).min(numel);

        let mut partition = full.narrow_flat(start, end - start)?;
        let padding = per_rank - (end - start);
        if padding > 0 {
            let zeros = Tensor::zeros(full.dtype().clone(), &[padding])?;
            partition = Tensor::cat_flat(&[partition, zeros])?;
        }

        Ok(Self::from_partition(partition_id, full.shape(), partition))
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn status(&self) -> PartitionStatus {
        self.state.lock().status
    }

    pub fn local_partition(&self) -> &Tensor {
        &self.partition
    }

    pub fn full_shape(&self) -> &[usize] {
        &self.full_shape
    }

    pub fn numel(&self) -> usize {
        self.full_shape.iter().product()
    }

    /// The full value, only while a gather scope holds it
    pub fn full(&self) -> Result<Tensor> {
        let state = self.state.lock();
        state.full.clone().ok_or_else(|| Error::PartitionUnavailable {
            partition_id: self.partition_id,
            status: state.status.to_string(),
        })
    }

    /// Collective: reassemble the full tensor from every rank's partition
    async fn fetch(&self, group: &dyn ProcessGroup) -> Result<()> {
        self.state.lock().status = PartitionStatus::InFlight;
        let mut pending = PendingFetch {
            tensor: self,
            done: false,
        };

        let parts = group.all_gather(&self.partition).await?;
        let flat = Tensor::cat_flat(&parts)?;
        let full = flat.narrow_flat(0, self.numel())?.reshape(&self.full_shape)?;

        let mut state = self.state.lock();
        state.full = Some(full);
        state.status = PartitionStatus::Available;
        pending.done = true;
        Ok(())
    }

    /// Drop the full tensor and fall back to the local partition
    fn release(&self) {
        let mut state = self.state.lock();
        state.full = None;
        state.status = PartitionStatus::NotAvailable;
    }
}

/// Puts a partition back to `NotAvailable` when a fetch errors or is dropped
struct PendingFetch<'a> {
    tensor: &'a ShardedTensor,
    done: bool,
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.tensor.release();
        }
    }
}

/// Backing storage of a [`Parameter`]
#[derive(Debug)]
pub enum ParamStorage {
    Local(Tensor),
    Sharded(ShardedTensor),
}

#[derive(Debug)]
pub struct Parameter {
    pub requires_grad: bool,
    pub storage: ParamStorage,
}

impl Parameter {
    pub fn local(tensor: Tensor) -> Self {
        Self {
            requires_grad: true,
            storage: ParamStorage::Local(tensor),
        }
    }

    pub fn sharded(tensor: ShardedTensor) -> Self {
        Self {
            requires_grad: true,
            storage: ParamStorage::Sharded(tensor),
        }
    }

    pub fn frozen(mut self) -> Self {
        self.requires_grad = false;
        self
    }

    pub fn dtype(&self) -> &DType {
        match &self.storage {
            ParamStorage::Local(t) => t.dtype(),
            ParamStorage::Sharded(s) => &s.dtype,
        }
    }

    /// Element count of the full (unpartitioned) parameter
    pub fn numel(&self) -> usize {
        match &self.storage {
            ParamStorage::Local(t) => t.numel(),
            ParamStorage::Sharded(s) => s.numel(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match &self.storage {
            ParamStorage::Local(t) => t.shape(),
            ParamStorage::Sharded(s) => s.full_shape(),
        }
    }

    pub fn partition_id(&self) -> Option<PartitionId> {
        match &self.storage {
            ParamStorage::Local(_) => None,
            ParamStorage::Sharded(s) => Some(s.partition_id),
        }
    }

    pub fn is_sharded(&self) -> bool {
        self.partition_id().is_some()
    }

    /// Full value of the parameter
    ///
    /// Sharded parameters only have one inside a [`GatheredParameters`] scope.
    pub fn data(&self) -> Result<Tensor> {
        match &self.storage {
            ParamStorage::Local(t) => Ok(t.clone()),
            ParamStorage::Sharded(s) => s.full(),
        }
    }
}

/// Sharded parameters that still need a gather before they can be read
pub fn params_to_fetch<'a>(params: &[&'a Parameter]) -> Vec<&'a ShardedTensor> {
    params
        .iter()
        .filter_map(|p| match &p.storage {
            ParamStorage::Sharded(s) if s.status() == PartitionStatus::NotAvailable => Some(s),
            _ => None,
        })
        .collect()
}

/// Scope in which partitioned parameters hold their full value
///
/// Entering gathers every parameter that is not yet available; dropping the
/// scope re-partitions exactly those parameters, on success and error paths
/// alike.
#[must_use = "the gathered value is released as soon as the scope is dropped"]
pub struct GatheredParameters<'a> {
    fetched: Vec<&'a ShardedTensor>,
}

impl<'a> GatheredParameters<'a> {
    /// Collective: every rank must enter with the same parameter list
    pub async fn gather(
        params: &[&'a Parameter],
        group: &dyn ProcessGroup,
        enabled: bool,
    ) -> Result<GatheredParameters<'a>> {
        let mut scope = GatheredParameters {
            fetched: Vec::new(),
        };
        if !enabled {
            return Ok(scope);
        }

        for sharded in params_to_fetch(params) {
            // On error `scope` drops here and releases what it already holds
            sharded.fetch(group).await?;
            scope.fetched.push(sharded);
        }

        debug!(
            rank = group.rank(),
            fetched = scope.fetched.len(),
            "Gathered partitioned parameters"
        );
        Ok(scope)
    }

    pub fn len(&self) -> usize {
        self.fetched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetched.is_empty()
    }
}

impl Drop for GatheredParameters<'_> {
    fn drop(&mut self) {
        for sharded in self.fetched.drain(..) {
            if sharded.status() != PartitionStatus::Available {
                warn!(
                    partition_id = sharded.partition_id,
                    status = %sharded.status(),
                    "Releasing parameter that was not fully gathered"
                );
            }
            sharded.release();
        }
    }
}

/// Ordered named-parameter container
#[derive(Debug, Default)]
pub struct ParamModule {
    config: ModelConfig,
    parameters: Vec<(String, Parameter)>,
    buffers: Vec<(String, Tensor)>,
}

impl ParamModule {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            parameters: Vec::new(),
            buffers: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, parameter: Parameter) -> Self {
        self.add_parameter(name, parameter);
        self
    }

    pub fn with_buffer(mut self, name: impl Into<String>, buffer: Tensor) -> Self {
        self.buffers.push((name.into(), buffer));
        self
    }

    pub fn add_parameter(&mut self, name: impl Into<String>, parameter: Parameter) {
        self.parameters.push((name.into(), parameter));
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
    }
}

impl Module for ParamModule {
    fn named_parameters(&self) -> Vec<(&str, &Parameter)> {
        self.parameters
            .iter()
            .map(|(name, p)| (name.as_str(), p))
            .collect()
    }

    fn named_buffers(&self) -> Vec<(&str, &Tensor)> {
        self.buffers
            .iter()
            .map(|(name, t)| (name.as_str(), t))
            .collect()
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }
}
