//! GPU back-end for a progpow-family proof-of-work search.
//!
//! The crate covers the device side of a miner: compiling and caching the
//! period-specialized search kernel, staging the per-epoch dataset, and a
//! dispatch/harvest loop that overlaps kernel execution with result readback.
//! Job scheduling, networking and share submission belong to the embedder.
//!
//! One [`DeviceWorker`] owns one device on a dedicated thread. Control moves
//! in through work and epoch handoffs plus pause flags; solutions and faults
//! come back over a [`WorkerEvent`] channel. The [`SearchDevice`] trait seals
//! the runtime off from the rest of the crate; the `opencl` feature supplies
//! the real implementation.

pub mod cache;
pub mod compile;
pub mod config;
pub mod device;
pub mod epoch;
pub mod pause;
pub mod search;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{KernelCache, KernelSelector};
pub use compile::{ensure_search_kernel, KernelBuild, KernelSourceProvider};
pub use config::SearchSettings;
pub use device::{
    ComputeCapability, DeviceAbort, DeviceError, DeviceIdentity, FoundNonce, MonitorRecord,
    PlatformKind, SearchDevice, SearchReadback, VendorPolicy, WaitStrategy, MAX_SEARCH_RESULTS,
};
#[cfg(feature = "opencl")]
pub use device::opencl::{ClSearchDevice, DiscoveredDevice};
pub use epoch::{prepare_epoch, EpochOutcome};
pub use pause::{PauseController, PauseReason};
pub use search::{run_search, KernelTimer, SearchContext, SearchOutcome, SearchStop, TargetShadow};
pub use types::{EpochContext, RateSample, SearchResult, WorkPackage, WorkerEvent};
pub use worker::DeviceWorker;
