//! One thread per device. The owner hands packages and epoch contexts to a
//! [`DeviceWorker`] and listens on one event channel; the thread does
//! everything else, including staying alive through recoverable faults.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;
use log::{debug, info, warn};

use crate::cache::KernelCache;
use crate::compile::{ensure_search_kernel, KernelBuild, KernelSourceProvider};
use crate::config::SearchSettings;
use crate::device::{DeviceAbort, DeviceIdentity, SearchDevice};
use crate::epoch::{prepare_epoch, EpochOutcome};
use crate::pause::{PauseController, PauseReason};
use crate::search::{run_search, KernelTimer, SearchContext, SearchStop, TargetShadow};
use crate::types::{EpochContext, RateSample, SearchResult, WorkPackage, WorkerEvent};

const LOG_TARGET: &str = "dredge::worker";

/// Poll cadence while the thread has nothing it can act on.
const IDLE_POLL: Duration = Duration::from_millis(25);
/// How long an event send may block before the event is counted as dropped.
const EVENT_SEND_TIMEOUT: Duration = Duration::from_millis(100);

struct WorkerShared {
    device_index: u32,
    stop: AtomicBool,
    /// Bumped after every slot update; the search loop compares it against
    /// the value its package was read under.
    generation: AtomicU64,
    work: RwLock<Option<Arc<WorkPackage>>>,
    epoch: RwLock<Option<Arc<EpochContext>>>,
    pause: PauseController,
    total_hashes: AtomicU64,
    window_hashes: AtomicU64,
    window_micros: AtomicU64,
    dropped_events: AtomicU64,
    error_emitted: AtomicBool,
    events: Sender<WorkerEvent>,
}

impl WorkerShared {
    fn new(device_index: u32, events: Sender<WorkerEvent>) -> Self {
        Self {
            device_index,
            stop: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            work: RwLock::new(None),
            epoch: RwLock::new(None),
            pause: PauseController::new(),
            total_hashes: AtomicU64::new(0),
            window_hashes: AtomicU64::new(0),
            window_micros: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            error_emitted: AtomicBool::new(false),
            events,
        }
    }

    fn current_work(&self) -> Option<Arc<WorkPackage>> {
        read_slot(&self.work).clone()
    }

    fn current_epoch(&self) -> Option<Arc<EpochContext>> {
        read_slot(&self.epoch).clone()
    }

    fn reset_window(&self) {
        self.window_hashes.store(0, Ordering::Relaxed);
        self.window_micros.store(0, Ordering::Relaxed);
    }

    fn send_event(&self, event: WorkerEvent) {
        if self.events.send_timeout(event, EVENT_SEND_TIMEOUT).is_err() {
            let dropped = self.dropped_events.fetch_add(1, Ordering::AcqRel) + 1;
            warn!(
                target: LOG_TARGET,
                "event channel stalled, {dropped} events dropped on device {}", self.device_index
            );
        }
    }

    /// Terminal faults only. The first one wins; a thread on its way out
    /// must not bury it under follow-up noise.
    fn emit_error(&self, message: String) {
        if self.error_emitted.swap(true, Ordering::AcqRel) {
            return;
        }
        self.send_event(WorkerEvent::Error {
            device_index: self.device_index,
            message,
        });
    }
}

impl SearchContext for WorkerShared {
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn work_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    fn submit(&self, result: SearchResult) {
        info!(
            target: LOG_TARGET,
            "device {} found nonce {:#018x} at epoch {}",
            self.device_index,
            result.nonce,
            result.work.epoch
        );
        self.send_event(WorkerEvent::Solution(result));
    }

    fn record_rate(&self, sample: RateSample) {
        self.total_hashes.fetch_add(sample.hashes, Ordering::Relaxed);
        self.window_hashes.fetch_add(sample.hashes, Ordering::Relaxed);
        self.window_micros.fetch_add(sample.micros, Ordering::Relaxed);
    }
}

/// Owning handle for one device thread.
pub struct DeviceWorker {
    identity: DeviceIdentity,
    shared: Arc<WorkerShared>,
    abort: Arc<dyn DeviceAbort>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceWorker {
    /// Starts the thread for `device`. The worker owns the device from here
    /// on; `events` is where solutions and terminal faults arrive.
    pub fn spawn<D>(
        device: D,
        device_index: u32,
        cache: Arc<KernelCache>,
        provider: Arc<dyn KernelSourceProvider>,
        settings: SearchSettings,
        events: Sender<WorkerEvent>,
    ) -> Result<Self>
    where
        D: SearchDevice + 'static,
    {
        settings.validate().context("device worker settings")?;
        let identity = device.identity().clone();
        let abort = device.abort_handle();
        let shared = Arc::new(WorkerShared::new(device_index, events));

        info!(
            target: LOG_TARGET,
            "worker {device_index} drives {} ({})", identity.name, identity.unique_id
        );
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("dredge-worker-{device_index}"))
            .spawn(move || {
                worker_loop(device, &thread_shared, &cache, provider.as_ref(), &settings);
            })
            .context("spawning device worker thread")?;

        Ok(Self {
            identity,
            shared,
            abort,
            handle: Some(handle),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Installs the context the next packages will be searched under.
    pub fn set_epoch(&self, ctx: EpochContext) {
        *write_slot(&self.shared.epoch) = Some(Arc::new(ctx));
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.kick();
    }

    /// Hands the thread a fresh package and cuts the in-flight batch short.
    pub fn set_work(&self, work: WorkPackage) {
        *write_slot(&self.shared.work) = Some(Arc::new(work));
        self.shared.reset_window();
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.kick();
    }

    pub fn pause(&self, reason: PauseReason) {
        self.shared.pause.pause(reason);
        self.kick();
    }

    pub fn resume(&self, reason: PauseReason) {
        self.shared.pause.resume(reason);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.pause.is_paused()
    }

    pub fn pause_reasons(&self) -> Vec<PauseReason> {
        self.shared.pause.reasons()
    }

    /// Flips the abort word so a batch the device is still running exits at
    /// its next round boundary.
    pub fn kick(&self) {
        if let Err(err) = self.abort.signal() {
            warn!(
                target: LOG_TARGET,
                "abort signal failed on device {}: {err}", self.shared.device_index
            );
        }
    }

    pub fn total_hashes(&self) -> u64 {
        self.shared.total_hashes.load(Ordering::Relaxed)
    }

    /// Hash and elapsed accumulators for the current package's window.
    pub fn hash_sample(&self) -> RateSample {
        RateSample {
            hashes: self.shared.window_hashes.load(Ordering::Relaxed),
            micros: self.shared.window_micros.load(Ordering::Relaxed),
        }
    }

    /// Rate over the current package's window.
    pub fn hashrate(&self) -> f64 {
        self.hash_sample().hashes_per_second()
    }

    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped_events.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.kick();
    }

    /// Stops the thread and waits for it to wind down.
    pub fn join(mut self) -> Result<()> {
        self.stop();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("device worker thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<D>(
    mut device: D,
    shared: &Arc<WorkerShared>,
    cache: &KernelCache,
    provider: &dyn KernelSourceProvider,
    settings: &SearchSettings,
) where
    D: SearchDevice,
{
    let device_index = shared.device_index;
    let mut prepared_epoch: Option<u64> = None;
    let mut loaded_period: Option<u32> = None;
    // Failed attempts are latched per generation, so they retry when new
    // work arrives instead of spinning.
    let mut epoch_latch: Option<(u64, u64)> = None;
    let mut period_latch: Option<(u64, u32)> = None;
    let mut shadow = TargetShadow::default();
    let mut timer = KernelTimer::new(settings.ema_alpha);
    let mut resume_nonce: Option<(u64, u64)> = None;

    while !shared.should_stop() {
        let generation = shared.work_generation();
        let Some(work) = shared.current_work() else {
            thread::sleep(IDLE_POLL);
            continue;
        };
        let Some(epoch) = shared.current_epoch() else {
            thread::sleep(IDLE_POLL);
            continue;
        };
        if epoch.epoch != work.epoch {
            // Stale context; the owner pushes the matching one next.
            thread::sleep(IDLE_POLL);
            continue;
        }
        if shared.pause.holds(PauseReason::UserRequest)
            || shared.pause.holds(PauseReason::Overheat)
        {
            thread::sleep(IDLE_POLL);
            continue;
        }

        if prepared_epoch != Some(epoch.epoch) {
            // The latch holds only while its pause reason does, so an
            // explicit resume retries without waiting for new work.
            if epoch_latch == Some((generation, epoch.epoch))
                && (shared.pause.holds(PauseReason::InsufficientMemory)
                    || shared.pause.holds(PauseReason::EpochInitError))
            {
                thread::sleep(IDLE_POLL);
                continue;
            }
            match prepare_epoch(&mut device, &shared.pause, settings, &epoch) {
                EpochOutcome::Ready => {
                    prepared_epoch = Some(epoch.epoch);
                    loaded_period = None;
                    epoch_latch = None;
                }
                EpochOutcome::Paused(_) => {
                    epoch_latch = Some((generation, epoch.epoch));
                    continue;
                }
                EpochOutcome::Fatal(err) => {
                    shared.emit_error(format!(
                        "device {device_index} wedged while generating epoch {}: {err}",
                        epoch.epoch
                    ));
                    break;
                }
            }
        }

        if shared.is_paused() {
            thread::sleep(IDLE_POLL);
            continue;
        }

        if loaded_period != Some(work.period) {
            if period_latch == Some((generation, work.period)) {
                thread::sleep(IDLE_POLL);
                continue;
            }
            let build = KernelBuild {
                period: work.period,
                dag_bytes: epoch.dag_bytes,
                dag_items: epoch.dag_items,
            };
            match ensure_search_kernel(&mut device, cache, provider, settings, &build) {
                Ok(()) => {
                    loaded_period = Some(work.period);
                    period_latch = None;
                    // The fresh program has no bound loaded yet.
                    shadow.invalidate();
                }
                Err(err) => {
                    shared.send_event(WorkerEvent::Error {
                        device_index,
                        message: format!(
                            "search kernel build failed at period {}: {err}",
                            work.period
                        ),
                    });
                    period_latch = Some((generation, work.period));
                    continue;
                }
            }
        }

        // A package interrupted by a pause picks up where it left off.
        let batch_work = match resume_nonce {
            Some((resume_generation, nonce)) if resume_generation == generation => {
                Arc::new(WorkPackage {
                    start_nonce: nonce,
                    ..(*work).clone()
                })
            }
            _ => Arc::clone(&work),
        };

        match run_search(
            &mut device,
            shared.as_ref(),
            settings,
            &mut shadow,
            &mut timer,
            &batch_work,
            generation,
            device_index,
        ) {
            Ok(outcome) => {
                resume_nonce = Some((generation, outcome.next_nonce));
                match outcome.stop {
                    SearchStop::NewWork => {}
                    SearchStop::Paused => thread::sleep(IDLE_POLL),
                    SearchStop::Stopped => break,
                }
            }
            Err(err) => {
                shared.emit_error(format!(
                    "device {device_index} api failure during search: {err}"
                ));
                break;
            }
        }
    }

    debug!(target: LOG_TARGET, "worker {device_index} wound down");
}

fn read_slot<T>(slot: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    slot.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_slot<T>(slot: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    slot.write().unwrap_or_else(PoisonError::into_inner)
}
