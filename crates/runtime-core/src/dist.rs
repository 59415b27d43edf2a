//! Distributed execution context and collectives
//!
//! Collectives are SPMD: every rank in a group has to reach the same
//! collective the same number of times, otherwise the group hangs. There is
//! no timeout; a stuck collective has to be killed from outside.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;
use tracing::{debug, instrument};

use crate::{DType, Element, Error, Rank, Result, Tensor};

/// A group of workers that can run collectives together
#[async_trait]
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> usize;

    /// Collect every rank's tensor, ordered by rank
    async fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>>;

    /// Element-wise sum across ranks; the result keeps the input dtype
    ///
    /// Integer sums are exact and wrap on overflow.
    async fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Wait until every rank of the group gets here
    async fn barrier(&self) -> Result<()>;
}

/// Explicit handle to the distributed runtime, passed to every collective
#[derive(Clone, Default)]
pub struct DistributedContext {
    group: Option<Arc<dyn ProcessGroup>>,
}

impl DistributedContext {
    pub fn new(group: Arc<dyn ProcessGroup>) -> Self {
        Self { group: Some(group) }
    }

    /// Context for a process that never joined a group
    pub fn uninitialized() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.group.is_some()
    }

    pub fn group(&self) -> Result<&Arc<dyn ProcessGroup>> {
        self.group.as_ref().ok_or(Error::DistributedNotInitialized)
    }

    pub fn rank(&self) -> Option<Rank> {
        self.group.as_ref().map(|g| g.rank())
    }

    pub fn world_size(&self) -> Option<usize> {
        self.group.as_ref().map(|g| g.world_size())
    }
}

impl fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .finish()
    }
}

/// Average `tensor` over every rank of the group
///
/// Floating point tensors keep their dtype; integer tensors come back as
/// `float32`, matching true division in the training framework.
#[instrument(skip(ctx, tensor), fields(dtype = %tensor.dtype(), numel = tensor.numel()))]
pub async fn get_all_reduce_mean(ctx: &DistributedContext, tensor: &Tensor) -> Result<Tensor> {
    let group = ctx.group()?;
    let summed = group.all_reduce(tensor).await?;

    let out_dtype = if summed.dtype().is_floating_point() {
        summed.dtype().clone()
    } else {
        DType::F32
    };
    let world_size = group.world_size() as f64;
    let values: Vec<f64> = summed
        .to_f64_vec()?
        .into_iter()
        .map(|v| v / world_size)
        .collect();

    Ok(Tensor::from_f64(&values, out_dtype, summed.shape())?.to(tensor.device()))
}

/// Per-rank collective call counters
#[derive(Debug, Default)]
pub struct CollectiveStats {
    all_gather: AtomicU64,
    all_reduce: AtomicU64,
    barrier: AtomicU64,
}

impl CollectiveStats {
    pub fn all_gather_calls(&self) -> u64 {
        self.all_gather.load(Ordering::SeqCst)
    }

    pub fn all_reduce_calls(&self) -> u64 {
        self.all_reduce.load(Ordering::SeqCst)
    }

    pub fn barrier_calls(&self) -> u64 {
        self.barrier.load(Ordering::SeqCst)
    }
}

/// Shared rendezvous state of an in-process group
#[derive(Debug)]
struct Rendezvous {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Tensor>>>,
}

/// Process group whose ranks are tasks of the same process
///
/// Every rank deposits its contribution in a shared slot table and meets the
/// others at a barrier; a second barrier keeps the table stable until all
/// ranks have read it.
#[derive(Debug)]
pub struct LocalProcessGroup {
    rank: Rank,
    world_size: usize,
    shared: Arc<Rendezvous>,
    stats: CollectiveStats,
}

impl LocalProcessGroup {
    /// Create one handle per rank for a group of `world_size` ranks
    pub fn new_group(world_size: usize) -> Result<Vec<Arc<LocalProcessGroup>>> {
        if world_size == 0 {
            return Err(Error::InvalidConfig {
                message: "world size must be at least 1".to_string(),
            });
        }

        let shared = Arc::new(Rendezvous {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });

        Ok((0..world_size)
            .map(|rank| {
                Arc::new(LocalProcessGroup {
                    rank,
                    world_size,
                    shared: Arc::clone(&shared),
                    stats: CollectiveStats::default(),
                })
            })
            .collect())
    }

    pub fn stats(&self) -> &CollectiveStats {
        &self.stats
    }

    async fn exchange(&self, operation: &str, tensor: &Tensor) -> Result<Vec<Tensor>> {
        self.shared.slots.lock()[self.rank] = Some(tensor.clone());
        self.shared.barrier.wait().await;

        let gathered: Option<Vec<Tensor>> = self.shared.slots.lock().iter().cloned().collect();
        self.shared.barrier.wait().await;

        gathered.ok_or_else(|| Error::CollectiveFailed {
            operation: operation.to_string(),
            message: "a rank did not contribute to the collective".to_string(),
        })
    }
}

#[async_trait]
impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        self.stats.all_gather.fetch_add(1, Ordering::SeqCst);
        debug!(rank = self.rank, numel = tensor.numel(), "all_gather");
        self.exchange("all_gather", tensor).await
    }

    async fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        self.stats.all_reduce.fetch_add(1, Ordering::SeqCst);
        let dtype = tensor.dtype();
        if !(dtype.is_floating_point() || dtype.is_integer()) {
            return Err(Error::unsupported_dtype(dtype));
        }

        let parts = self.exchange("all_reduce", tensor).await?;
        if let Some(part) = parts.iter().find(|p| p.shape() != tensor.shape()) {
            return Err(Error::ShapeMismatch {
                expected: tensor.shape().to_vec(),
                actual: part.shape().to_vec(),
            });
        }

        // Summed in rank order so every rank sees the same result
        let shape = tensor.shape();
        let reduced = match dtype {
            DType::U8 => Tensor::from_slice(&wrapping_sum(&parts, u8::wrapping_add)?, shape)?,
            DType::I8 => Tensor::from_slice(&wrapping_sum(&parts, i8::wrapping_add)?, shape)?,
            DType::I16 => Tensor::from_slice(&wrapping_sum(&parts, i16::wrapping_add)?, shape)?,
            DType::I32 => Tensor::from_slice(&wrapping_sum(&parts, i32::wrapping_add)?, shape)?,
            DType::I64 => Tensor::from_slice(&wrapping_sum(&parts, i64::wrapping_add)?, shape)?,
            _ => {
                let mut acc = vec![0.0f64; tensor.numel()];
                for part in &parts {
                    for (a, b) in acc.iter_mut().zip(part.to_f64_vec()?) {
                        *a += b;
                    }
                }
                Tensor::from_f64(&acc, dtype.clone(), shape)?
            }
        };

        Ok(reduced.to(tensor.device()))
    }

    async fn barrier(&self) -> Result<()> {
        self.stats.barrier.fetch_add(1, Ordering::SeqCst);
        self.shared.barrier.wait().await;
        Ok(())
    }
}

fn wrapping_sum<T: Element>(parts: &[Tensor], add: fn(T, T) -> T) -> Result<Vec<T>> {
    let mut parts = parts.iter();
    let mut acc = match parts.next() {
        Some(first) => first.to_vec::<T>()?,
        None => return Ok(Vec::new()),
    };
    for part in parts {
        for (a, b) in acc.iter_mut().zip(part.to_vec::<T>()?) {
            *a = add(*a, b);
        }
    }
    Ok(acc)
}
