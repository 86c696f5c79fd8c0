//! The per-device search loop.
//!
//! One call works through a single work package. Every iteration first
//! harvests the batch the device is already running, then immediately queues
//! the next batch, and only then reports the harvested hits, so the device
//! never sits idle while the host does bookkeeping. When work changes or the
//! loop is told to stop it drains the in-flight batch instead of abandoning
//! it.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::config::SearchSettings;
use crate::device::{DeviceError, FoundNonce, SearchDevice, WaitStrategy, MAX_SEARCH_RESULTS};
use crate::types::{RateSample, SearchResult, WorkPackage};

const LOG_TARGET: &str = "dredge::search";

/// The loop's view of its owner. Checked once per iteration.
pub trait SearchContext {
    fn should_stop(&self) -> bool;
    /// Monotonic counter the owner bumps whenever a new package arrives.
    fn work_generation(&self) -> u64;
    fn is_paused(&self) -> bool;
    fn submit(&self, result: SearchResult);
    fn record_rate(&self, sample: RateSample);
}

/// Why [`run_search`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStop {
    NewWork,
    Paused,
    Stopped,
}

#[derive(Debug)]
pub struct SearchOutcome {
    pub stop: SearchStop,
    /// First nonce no batch has covered yet.
    pub next_nonce: u64,
    pub batches: u32,
    pub hashes: u64,
}

/// Host-side copy of the upper-bound word last written to the device, so an
/// unchanged bound is not rewritten on every package. Must be invalidated
/// whenever a different program is loaded.
#[derive(Debug, Default)]
pub struct TargetShadow(Option<u64>);

impl TargetShadow {
    pub fn invalidate(&mut self) {
        self.0 = None;
    }

    /// Records `word` and says whether the device copy is out of date.
    fn update(&mut self, word: u64) -> bool {
        if self.0 == Some(word) {
            return false;
        }
        self.0 = Some(word);
        true
    }
}

/// Exponential average of recent kernel execution times, used to sleep
/// through most of a batch instead of spinning in the driver. One per
/// device; the estimate carries across packages, so only the very first
/// batch after startup is waited out blind.
#[derive(Debug)]
pub struct KernelTimer {
    ema_micros: f64,
    alpha: f64,
}

impl KernelTimer {
    pub fn new(alpha: f64) -> Self {
        Self {
            ema_micros: 0.0,
            alpha,
        }
    }

    fn observe(&mut self, elapsed: Duration) {
        let micros = elapsed.as_micros() as f64;
        self.ema_micros = self.ema_micros * self.alpha + (1.0 - self.alpha) * micros;
    }

    /// How long to sleep before polling for the running batch. `None` until
    /// the first batch has been timed.
    fn sleep_hint(&self, ratio: f64) -> Option<Duration> {
        if self.ema_micros <= 0.0 {
            return None;
        }
        Some(Duration::from_micros((self.ema_micros * ratio) as u64))
    }
}

/// Searches `work` on `device` until the owner stops it, pauses it or hands
/// out a new package. `generation` is the counter value `work` was read
/// under; a later value means fresher work is waiting. `timer` outlives the
/// package, seeding the first wait of the next one.
pub fn run_search<D, C>(
    device: &mut D,
    ctx: &C,
    settings: &SearchSettings,
    shadow: &mut TargetShadow,
    timer: &mut KernelTimer,
    work: &Arc<WorkPackage>,
    generation: u64,
    device_index: u32,
) -> Result<SearchOutcome, DeviceError>
where
    D: SearchDevice + ?Sized,
    C: SearchContext + ?Sized,
{
    let wait = device.identity().platform.policy().wait;
    let global = settings.global_work_size();
    let local = u64::from(settings.local_work_size);

    device.write_search_header(&work.header)?;
    let target = work.target_word();
    if shadow.update(target) {
        debug!(target: LOG_TARGET, "upper bound is now {target:#018x}");
        device.write_search_target(target)?;
    }

    let mut start_nonce = work.start_nonce;
    let mut in_flight: Option<Instant> = None;
    let mut pending: Vec<FoundNonce> = Vec::with_capacity(MAX_SEARCH_RESULTS as usize);
    let mut hashes = 0u64;
    let mut batches = 0u32;
    let mut last_report = Instant::now();

    let stop = loop {
        let stop_reason = if ctx.should_stop() {
            Some(SearchStop::Stopped)
        } else if ctx.work_generation() != generation {
            Some(SearchStop::NewWork)
        } else if ctx.is_paused() {
            Some(SearchStop::Paused)
        } else {
            None
        };

        pending.clear();
        let mut rounds = 0u32;
        if let Some(dispatched_at) = in_flight.take() {
            let results = match wait {
                WaitStrategy::AdaptiveSleep => {
                    device.request_search_results()?;
                    if let Some(hint) = timer.sleep_hint(settings.sleep_ratio) {
                        thread::sleep(hint);
                    }
                    let results = device.wait_search_results()?;
                    timer.observe(dispatched_at.elapsed());
                    results
                }
                WaitStrategy::BlockingRead => device.read_search_results()?,
            };
            let found = results.count.min(MAX_SEARCH_RESULTS) as usize;
            pending.extend_from_slice(&results.found[..found]);
            rounds = results.rounds;
        }

        if stop_reason.is_none() {
            device.reset_search_counters()?;
            device.enqueue_search(start_nonce)?;
            in_flight = Some(Instant::now());
            start_nonce = start_nonce.wrapping_add(global);
            batches += 1;
        }

        // Report hits only after the device is busy again.
        for hit in &pending {
            debug!(
                target: LOG_TARGET,
                "nonce {:#018x} meets the bound on device {device_index}", hit.nonce
            );
            ctx.submit(SearchResult {
                nonce: hit.nonce,
                mix: hit.mix,
                work: Arc::clone(work),
                found_at: Instant::now(),
                device_index,
            });
        }

        let batch_hashes = local * u64::from(rounds);
        hashes += batch_hashes;
        ctx.record_rate(RateSample {
            hashes: batch_hashes,
            micros: last_report.elapsed().as_micros() as u64,
        });
        last_report = Instant::now();

        if let Some(reason) = stop_reason {
            if in_flight.is_none() {
                break reason;
            }
        }
    };

    device.flush()?;
    Ok(SearchOutcome {
        stop,
        next_nonce: start_nonce,
        batches,
        hashes,
    })
}
