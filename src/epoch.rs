use std::time::Instant;

use log::{error, info, warn};

use crate::config::SearchSettings;
use crate::device::{DeviceError, SearchDevice};
use crate::pause::{PauseController, PauseReason};
use crate::types::EpochContext;

const LOG_TARGET: &str = "dredge::epoch";

/// Each dataset item is produced by two cooperating work items.
const WORK_ITEMS_PER_DAG_ITEM: u32 = 2;

/// How a per-epoch preparation attempt ended.
#[derive(Debug)]
pub enum EpochOutcome {
    Ready,
    /// Recoverable. The matching controller flag is set and the worker stays
    /// alive so a later epoch can retry.
    Paused(PauseReason),
    /// The device failed mid-generation and its buffers are in an unknown
    /// state. The worker must exit.
    Fatal(DeviceError),
}

/// Readies `device` for `ctx`: checks that the dataset and cache fit,
/// allocates the epoch buffers, uploads the light cache and generates the
/// dataset in bounded chunks.
///
/// Both init-related pause flags are cleared up front, so a device paused by
/// an earlier epoch gets a fresh attempt on every call.
pub fn prepare_epoch<D>(
    device: &mut D,
    controller: &PauseController,
    settings: &SearchSettings,
    ctx: &EpochContext,
) -> EpochOutcome
where
    D: SearchDevice + ?Sized,
{
    controller.resume(PauseReason::InsufficientMemory);
    controller.resume(PauseReason::EpochInitError);

    let identity = device.identity();
    let device_name = identity.name.clone();
    let required = ctx.required_memory();
    if identity.total_memory < required {
        warn!(
            target: LOG_TARGET,
            "{device_name} has {} MB but epoch {} needs {} MB, pausing",
            identity.total_memory / (1024 * 1024),
            ctx.epoch,
            required / (1024 * 1024)
        );
        controller.pause(PauseReason::InsufficientMemory);
        return EpochOutcome::Paused(PauseReason::InsufficientMemory);
    }

    info!(
        target: LOG_TARGET,
        "initializing epoch {} on {device_name}: dataset {} MB, cache {} MB",
        ctx.epoch,
        ctx.dag_bytes / (1024 * 1024),
        ctx.light_bytes / (1024 * 1024)
    );
    let started = Instant::now();

    if let Err(err) = stage_epoch_buffers(device, ctx) {
        warn!(
            target: LOG_TARGET,
            "epoch {} staging failed on {device_name}: {err}", ctx.epoch
        );
        controller.pause(PauseReason::EpochInitError);
        return EpochOutcome::Paused(PauseReason::EpochInitError);
    }

    if let Err(err) = generate_dag(device, settings, ctx) {
        error!(
            target: LOG_TARGET,
            "dataset generation failed on {device_name} at epoch {}: {err}", ctx.epoch
        );
        controller.pause(PauseReason::EpochInitError);
        return EpochOutcome::Fatal(err);
    }

    info!(
        target: LOG_TARGET,
        "epoch {} ready on {device_name} in {} ms",
        ctx.epoch,
        started.elapsed().as_millis()
    );
    EpochOutcome::Ready
}

/// Allocation and the blocking light-cache upload. Failures here leave the
/// device reusable, unlike generation failures.
fn stage_epoch_buffers<D>(device: &mut D, ctx: &EpochContext) -> Result<(), DeviceError>
where
    D: SearchDevice + ?Sized,
{
    device.allocate_epoch_buffers(ctx.light_bytes, ctx.dag_bytes)?;
    device.upload_light_cache(&ctx.light_cache)
}

/// Walks the dataset in fixed-size dispatches so a single enqueue never ties
/// the device up long enough to trip a watchdog. The tail dispatch is rounded
/// up to whole work groups; the kernel bound-checks the overshoot.
fn generate_dag<D>(
    device: &mut D,
    settings: &SearchSettings,
    ctx: &EpochContext,
) -> Result<(), DeviceError>
where
    D: SearchDevice + ?Sized,
{
    let local = settings.local_work_size;
    let chunk = settings.dag_chunk_groups * local;
    let total = ctx.dag_items * WORK_ITEMS_PER_DAG_ITEM;

    let mut start = 0u32;
    while start + chunk <= total {
        device.generate_dag_chunk(start, chunk)?;
        start += chunk;
    }
    let remainder = total - start;
    if remainder > 0 {
        let rounded = remainder.div_ceil(local) * local;
        device.generate_dag_chunk(start, rounded)?;
    }
    Ok(())
}
