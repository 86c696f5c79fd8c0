use std::sync::Arc;
use std::time::Instant;

/// One immutable unit of work from the pool/work source. Swapped wholesale
/// when new work arrives; the search loop never mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPackage {
    pub header: [u8; 32],
    /// 256-bit big-endian difficulty boundary.
    pub boundary: [u8; 32],
    pub start_nonce: u64,
    /// Selects the DAG generation the work belongs to.
    pub epoch: u64,
    /// Selects the kernel program the work belongs to.
    pub period: u32,
}

impl WorkPackage {
    /// Top 64 bits of the boundary, the form the kernel compares hashes
    /// against.
    pub fn target_word(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.boundary[..8]);
        u64::from_be_bytes(raw)
    }
}

/// Per-epoch working-set parameters, supplied externally on epoch boundaries
/// and superseded wholesale.
#[derive(Debug, Clone)]
pub struct EpochContext {
    pub epoch: u64,
    pub dag_bytes: u64,
    pub light_bytes: u64,
    pub light_cache: Arc<[u8]>,
    /// Wide DAG items; generation dispatches two work units per item.
    pub dag_items: u32,
}

impl EpochContext {
    pub fn required_memory(&self) -> u64 {
        self.dag_bytes + self.light_bytes
    }
}

/// A nonce that satisfied the target, bound to the work it was found under.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub nonce: u64,
    pub mix: [u8; 32],
    pub work: Arc<WorkPackage>,
    pub found_at: Instant,
    pub device_index: u32,
}

/// Cumulative hash work for the current search window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateSample {
    pub hashes: u64,
    pub micros: u64,
}

impl RateSample {
    pub fn hashes_per_second(&self) -> f64 {
        if self.micros == 0 {
            return 0.0;
        }
        self.hashes as f64 * 1_000_000.0 / self.micros as f64
    }
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Solution(SearchResult),
    Error { device_index: u32, message: String },
}
