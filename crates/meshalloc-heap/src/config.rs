use std::time::Duration;

use getset::CopyGetters;

pub const QUANTUM: usize = 16;
pub const MAX_SIZE: usize = 1024;
pub const NCLASSES: usize = MAX_SIZE / QUANTUM;

/// Preferred span size before clamping the slot count.
pub const SPAN_TARGET: usize = 4096;
pub const MIN_OBJECTS: usize = 8;
pub const MAX_OBJECTS: usize = 256;

pub const FANOUT: usize = 64;

pub const DEFAULT_MESH_PROBES: usize = 64;
pub const DEFAULT_OCCUPANCY_CUTOFF: f64 = 0.8;
pub const DEFAULT_MESH_PERIOD: Duration = Duration::from_millis(100);

pub const ENV_MESHING: &str = "MESHALLOC_MESHING";
pub const ENV_MESH_PERIOD_MS: &str = "MESHALLOC_MESH_PERIOD_MS";
pub const ENV_SEED: &str = "MESHALLOC_SEED";

/// Runtime knobs for a [`GlobalHeap`](crate::global::GlobalHeap).
#[derive(Debug, Clone, Copy, PartialEq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct HeapConfig {
  meshing_enabled: bool,
  mesh_period: Duration,
  /// Right-hand candidates tried per left-hand miniheap in one pass.
  mesh_probes: usize,
  /// Miniheaps at or above this fraction of occupied slots are not meshed.
  occupancy_cutoff: f64,
  /// Fixed seed for slot-order randomization. `None` seeds from the OS.
  seed: Option<u64>,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      meshing_enabled: true,
      mesh_period: DEFAULT_MESH_PERIOD,
      mesh_probes: DEFAULT_MESH_PROBES,
      occupancy_cutoff: DEFAULT_OCCUPANCY_CUTOFF,
      seed: None,
    }
  }
}

impl HeapConfig {
  pub fn with_meshing(mut self, enabled: bool) -> Self {
    self.meshing_enabled = enabled;
    self
  }

  pub fn with_mesh_period(mut self, period: Duration) -> Self {
    self.mesh_period = period;
    self
  }

  pub fn with_mesh_probes(mut self, probes: usize) -> Self {
    self.mesh_probes = probes.max(1);
    self
  }

  pub fn with_occupancy_cutoff(mut self, cutoff: f64) -> Self {
    self.occupancy_cutoff = cutoff.clamp(0.0, 1.0);
    self
  }

  pub fn with_seed(mut self, seed: u64) -> Self {
    self.seed = Some(seed);
    self
  }

  /// Defaults overridden by `MESHALLOC_*` environment variables. Unparsable
  /// values are ignored.
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  fn from_lookup<F>(lookup: F) -> Self
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Self::default();

    if let Some(raw) = lookup(ENV_MESHING) {
      match raw.trim() {
        "0" | "false" | "off" => config.meshing_enabled = false,
        "1" | "true" | "on" => config.meshing_enabled = true,
        other => tracing::warn!(value = other, "ignoring {ENV_MESHING}"),
      }
    }

    if let Some(raw) = lookup(ENV_MESH_PERIOD_MS) {
      match raw.trim().parse::<u64>() {
        Ok(ms) => config.mesh_period = Duration::from_millis(ms),
        Err(_) => tracing::warn!(value = raw.as_str(), "ignoring {ENV_MESH_PERIOD_MS}"),
      }
    }

    if let Some(raw) = lookup(ENV_SEED) {
      match raw.trim().parse::<u64>() {
        Ok(seed) => config.seed = Some(seed),
        Err(_) => tracing::warn!(value = raw.as_str(), "ignoring {ENV_SEED}"),
      }
    }

    config
  }
}
