use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "opencl")]
pub mod opencl;

/// Result slots in the device-side result block. Kernels discard any hit
/// beyond this many per dispatch.
pub const MAX_SEARCH_RESULTS: u32 = 4;

/// Compute-capability level above which Nvidia kernels get the raised
/// register cap.
pub const NV_REG_CAP_TIER: u32 = 35;
pub const NV_MAX_REGS_ABOVE_TIER: u32 = 72;
pub const NV_MAX_REGS_BASE: u32 = 63;

/// Platform classes this back-end distinguishes. Discovery tags devices with
/// one of these; everything vendor-specific is looked up through
/// [`PlatformKind::policy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlatformKind {
    Nvidia,
    Amd,
    Clover,
    Unknown,
}

/// How the search loop waits for an in-flight kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// A blocking result read doubles as the completion wait.
    BlockingRead,
    /// Non-blocking read request, EMA-guided sleep, then an explicit queue
    /// wait. Used where blocking reads spin.
    AdaptiveSleep,
}

/// Per-platform behavior knobs, kept in one table so the search loop and the
/// compiler stay vendor-agnostic.
pub struct VendorPolicy {
    /// Value injected as the `PLATFORM` kernel macro.
    pub platform_define: u32,
    pub wait: WaitStrategy,
    pub build_options: fn(&DeviceIdentity) -> String,
}

static NVIDIA_POLICY: VendorPolicy = VendorPolicy {
    platform_define: 1,
    wait: WaitStrategy::AdaptiveSleep,
    build_options: nvidia_build_options,
};

static AMD_POLICY: VendorPolicy = VendorPolicy {
    platform_define: 2,
    wait: WaitStrategy::BlockingRead,
    build_options: no_build_options,
};

static CLOVER_POLICY: VendorPolicy = VendorPolicy {
    platform_define: 3,
    wait: WaitStrategy::BlockingRead,
    build_options: no_build_options,
};

static UNKNOWN_POLICY: VendorPolicy = VendorPolicy {
    platform_define: 0,
    wait: WaitStrategy::BlockingRead,
    build_options: no_build_options,
};

impl PlatformKind {
    pub fn policy(self) -> &'static VendorPolicy {
        match self {
            PlatformKind::Nvidia => &NVIDIA_POLICY,
            PlatformKind::Amd => &AMD_POLICY,
            PlatformKind::Clover => &CLOVER_POLICY,
            PlatformKind::Unknown => &UNKNOWN_POLICY,
        }
    }
}

fn nvidia_build_options(identity: &DeviceIdentity) -> String {
    let level = identity.compute.map(ComputeCapability::level).unwrap_or(0);
    let regs = if level > NV_REG_CAP_TIER {
        NV_MAX_REGS_ABOVE_TIER
    } else {
        NV_MAX_REGS_BASE
    };
    format!("-cl-nv-maxrregcount={regs}")
}

fn no_build_options(_identity: &DeviceIdentity) -> String {
    String::new()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    /// Single-number form used for tier comparisons, e.g. 6.1 -> 61.
    pub fn level(self) -> u32 {
        self.major * 10 + self.minor
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Immutable description of one physical device, produced by the external
/// discovery step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub platform: PlatformKind,
    /// Stable bus id, e.g. the PCI slot.
    pub unique_id: String,
    pub name: String,
    /// Present on Nvidia devices only.
    pub compute: Option<ComputeCapability>,
    pub total_memory: u64,
    pub max_work_group_size: usize,
    pub compute_units: u32,
}

impl DeviceIdentity {
    /// Passive record handed to the hardware-monitor collaborator.
    pub fn monitor_record(&self) -> MonitorRecord {
        MonitorRecord {
            platform: self.platform,
            unique_id: self.unique_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRecord {
    pub platform: PlatformKind,
    pub unique_id: String,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    /// The vendor compiler rejected the kernel; `log` is its diagnostic
    /// output.
    #[error("kernel build failed: {log}")]
    Build { log: String },
    #[error("device allocation failed: {0}")]
    OutOfMemory(String),
    #[error("device api error: {0}")]
    Api(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoundNonce {
    pub nonce: u64,
    pub mix: [u8; 32],
}

/// Host copy of the device-side result block.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchReadback {
    /// Hits the kernel recorded; may exceed the slot count, callers clamp.
    pub count: u32,
    /// Inner-loop rounds the kernel completed, for hash accounting.
    pub rounds: u32,
    pub found: [FoundNonce; MAX_SEARCH_RESULTS as usize],
}

/// Cross-thread handle that flips the abort word in the device-side result
/// block so an in-flight kernel can exit early.
pub trait DeviceAbort: Send + Sync {
    fn signal(&self) -> Result<(), DeviceError>;
}

/// One compute device with its context and queues. The worker thread owns the
/// implementation exclusively; only [`SearchDevice::abort_handle`] escapes to
/// other threads.
///
/// Dispatch entry points are asynchronous unless noted; readback entry points
/// pair with them as described on each method.
pub trait SearchDevice: Send {
    fn identity(&self) -> &DeviceIdentity;

    /// Compiles an assembled source listing and returns the portable binary.
    fn build_search_program(&mut self, source: &str, options: &str) -> Result<Vec<u8>, DeviceError>;

    /// Reconstructs the search kernel from a cached binary and rebinds its
    /// fixed arguments.
    fn load_search_program(&mut self, binary: &[u8]) -> Result<(), DeviceError>;

    /// Replaces the per-epoch light and DAG buffers. Previous epoch buffers
    /// are released.
    fn allocate_epoch_buffers(&mut self, light_bytes: u64, dag_bytes: u64)
        -> Result<(), DeviceError>;

    /// Blocking upload of the light cache into its buffer.
    fn upload_light_cache(&mut self, light: &[u8]) -> Result<(), DeviceError>;

    /// Dispatches `work_items` DAG-generation work units starting at `start`
    /// and waits for their completion.
    fn generate_dag_chunk(&mut self, start: u32, work_items: u32) -> Result<(), DeviceError>;

    fn write_search_header(&mut self, header: &[u8; 32]) -> Result<(), DeviceError>;

    fn write_search_target(&mut self, target: u64) -> Result<(), DeviceError>;

    /// Zeroes the result count, round counter and abort word ahead of a
    /// dispatch.
    fn reset_search_counters(&mut self) -> Result<(), DeviceError>;

    /// Asynchronously enqueues one search dispatch over the configured
    /// global/local work sizes.
    fn enqueue_search(&mut self, start_nonce: u64) -> Result<(), DeviceError>;

    /// Blocking readback; waits for the in-flight dispatch.
    fn read_search_results(&mut self) -> Result<SearchReadback, DeviceError>;

    /// Queues a non-blocking readback of the result block.
    fn request_search_results(&mut self) -> Result<(), DeviceError>;

    /// Waits for the queue, then returns the readback requested by
    /// [`SearchDevice::request_search_results`].
    fn wait_search_results(&mut self) -> Result<SearchReadback, DeviceError>;

    fn abort_handle(&self) -> Arc<dyn DeviceAbort>;

    /// Drains the main queue; called when a search session ends.
    fn flush(&mut self) -> Result<(), DeviceError>;
}
