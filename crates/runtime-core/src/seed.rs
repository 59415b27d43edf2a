//! Reproducible seeding of every random generator a training process uses

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

/// Framework-level seeding hook (dataloader workers, dropout kernels, ...)
pub trait SeedHook: Send {
    fn manual_seed(&mut self, seed: u64);
}

impl<F> SeedHook for F
where
    F: FnMut(u64) + Send,
{
    fn manual_seed(&mut self, seed: u64) {
        self(seed)
    }
}

/// The random generators of one training process
///
/// Unseeded generators start from OS entropy, so runs are only reproducible
/// after [`RngRegistry::set_random_seed`] has been called with a seed.
pub struct RngRegistry {
    /// General-purpose generator (sampling, shuffling helpers)
    general: ChaCha8Rng,

    /// Generator behind numeric-array routines
    numeric: ChaCha8Rng,

    /// Host-side tensor generator
    host: ChaCha8Rng,

    /// One generator per accelerator device index
    devices: BTreeMap<usize, ChaCha8Rng>,

    hooks: Vec<Box<dyn SeedHook>>,
}

impl Default for RngRegistry {
    fn default() -> Self {
        Self::new(0)
    }
}

impl RngRegistry {
    /// Registry with `device_count` accelerator generators
    pub fn new(device_count: usize) -> Self {
        Self {
            general: ChaCha8Rng::from_entropy(),
            numeric: ChaCha8Rng::from_entropy(),
            host: ChaCha8Rng::from_entropy(),
            devices: (0..device_count)
                .map(|index| (index, ChaCha8Rng::from_entropy()))
                .collect(),
            hooks: Vec::new(),
        }
    }

    pub fn register_hook(&mut self, hook: impl SeedHook + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Seed every generator and hook; `None` leaves all state untouched
    pub fn set_random_seed(&mut self, seed: Option<u64>) {
        let Some(seed) = seed else {
            return;
        };

        for hook in &mut self.hooks {
            hook.manual_seed(seed);
        }
        self.general = ChaCha8Rng::seed_from_u64(seed);
        self.numeric = ChaCha8Rng::seed_from_u64(seed);
        self.host = ChaCha8Rng::seed_from_u64(seed);
        for rng in self.devices.values_mut() {
            *rng = ChaCha8Rng::seed_from_u64(seed);
        }

        info!(seed, devices = self.devices.len(), "Seeded random generators");
    }

    pub fn general(&mut self) -> &mut ChaCha8Rng {
        &mut self.general
    }

    pub fn numeric(&mut self) -> &mut ChaCha8Rng {
        &mut self.numeric
    }

    pub fn host(&mut self) -> &mut ChaCha8Rng {
        &mut self.host
    }

    pub fn device(&mut self, index: usize) -> Option<&mut ChaCha8Rng> {
        self.devices.get_mut(&index)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

impl fmt::Debug for RngRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RngRegistry")
            .field("devices", &self.devices.len())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
