//! Scripted stand-in for a physical device, shared by the component tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::device::{
    ComputeCapability, DeviceAbort, DeviceError, DeviceIdentity, PlatformKind, SearchDevice,
    SearchReadback,
};

/// One recorded call against the mock, with the arguments the tests care
/// about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Build,
    LoadProgram,
    AllocBuffers { light_bytes: u64, dag_bytes: u64 },
    UploadLight { bytes: usize },
    GenerateChunk { start: u32, items: u32 },
    WriteHeader([u8; 32]),
    WriteTarget(u64),
    ResetCounters,
    Enqueue { start_nonce: u64 },
    ReadResults,
    RequestResults,
    WaitResults,
    Flush,
}

/// Hard cap on the recorded op log, so a worker thread spinning against the
/// mock cannot grow it without bound.
const OPS_CAP: usize = 1 << 16;

/// State shared between a [`MockDevice`], its clones and its abort handle.
#[derive(Default)]
pub struct MockState {
    pub builds: AtomicUsize,
    pub loads: AtomicUsize,
    pub aborts: AtomicUsize,
    ops: Mutex<Vec<MockOp>>,
    script: Mutex<VecDeque<SearchReadback>>,
    build_delay: Mutex<Option<Duration>>,
    harvest_delay: Mutex<Option<Duration>>,
    build_failure: Mutex<Option<String>>,
    fail_next_alloc: AtomicBool,
    fail_next_upload: AtomicBool,
    fail_next_generate: AtomicBool,
}

impl MockState {
    pub fn ops(&self) -> Vec<MockOp> {
        lock(&self.ops).clone()
    }

    /// Queues readbacks for the harvest calls to return, in order. Once the
    /// script runs dry the mock hands out empty readbacks.
    pub fn script_results<I>(&self, results: I)
    where
        I: IntoIterator<Item = SearchReadback>,
    {
        lock(&self.script).extend(results);
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *lock(&self.build_delay) = Some(delay);
    }

    /// Makes every harvest call take `delay`, pacing loops that otherwise
    /// spin flat out against the mock.
    pub fn set_harvest_delay(&self, delay: Duration) {
        *lock(&self.harvest_delay) = Some(delay);
    }

    pub fn fail_builds_with(&self, build_log: &str) {
        *lock(&self.build_failure) = Some(build_log.to_owned());
    }

    pub fn fail_next_alloc(&self) {
        self.fail_next_alloc.store(true, Ordering::Release);
    }

    pub fn fail_next_upload(&self) {
        self.fail_next_upload.store(true, Ordering::Release);
    }

    pub fn fail_next_generate(&self) {
        self.fail_next_generate.store(true, Ordering::Release);
    }

    fn record(&self, op: MockOp) {
        let mut ops = lock(&self.ops);
        if ops.len() < OPS_CAP {
            ops.push(op);
        }
    }

    fn next_result(&self) -> SearchReadback {
        if let Some(delay) = *lock(&self.harvest_delay) {
            thread::sleep(delay);
        }
        lock(&self.script).pop_front().unwrap_or_default()
    }
}

/// Device whose clones all share one [`MockState`], so racing workers can be
/// observed through a single op log.
#[derive(Clone)]
pub struct MockDevice {
    identity: DeviceIdentity,
    state: Arc<MockState>,
}

impl MockDevice {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            state: Arc::new(MockState::default()),
        }
    }

    pub fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }
}

impl SearchDevice for MockDevice {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn build_search_program(&mut self, source: &str, _options: &str) -> Result<Vec<u8>, DeviceError> {
        if let Some(delay) = *lock(&self.state.build_delay) {
            thread::sleep(delay);
        }
        self.state.builds.fetch_add(1, Ordering::AcqRel);
        self.state.record(MockOp::Build);
        if let Some(build_log) = lock(&self.state.build_failure).clone() {
            return Err(DeviceError::Build { log: build_log });
        }
        // The "binary" is the source itself so tests can inspect what was
        // compiled.
        Ok(source.as_bytes().to_vec())
    }

    fn load_search_program(&mut self, _binary: &[u8]) -> Result<(), DeviceError> {
        self.state.loads.fetch_add(1, Ordering::AcqRel);
        self.state.record(MockOp::LoadProgram);
        Ok(())
    }

    fn allocate_epoch_buffers(
        &mut self,
        light_bytes: u64,
        dag_bytes: u64,
    ) -> Result<(), DeviceError> {
        self.state.record(MockOp::AllocBuffers {
            light_bytes,
            dag_bytes,
        });
        if self.state.fail_next_alloc.swap(false, Ordering::AcqRel) {
            return Err(DeviceError::OutOfMemory("mock allocation refused".to_owned()));
        }
        Ok(())
    }

    fn upload_light_cache(&mut self, light: &[u8]) -> Result<(), DeviceError> {
        self.state.record(MockOp::UploadLight { bytes: light.len() });
        if self.state.fail_next_upload.swap(false, Ordering::AcqRel) {
            return Err(DeviceError::Api("mock upload refused".to_owned()));
        }
        Ok(())
    }

    fn generate_dag_chunk(&mut self, start: u32, work_items: u32) -> Result<(), DeviceError> {
        self.state.record(MockOp::GenerateChunk {
            start,
            items: work_items,
        });
        if self.state.fail_next_generate.swap(false, Ordering::AcqRel) {
            return Err(DeviceError::Api("mock dispatch refused".to_owned()));
        }
        Ok(())
    }

    fn write_search_header(&mut self, header: &[u8; 32]) -> Result<(), DeviceError> {
        self.state.record(MockOp::WriteHeader(*header));
        Ok(())
    }

    fn write_search_target(&mut self, target: u64) -> Result<(), DeviceError> {
        self.state.record(MockOp::WriteTarget(target));
        Ok(())
    }

    fn reset_search_counters(&mut self) -> Result<(), DeviceError> {
        self.state.record(MockOp::ResetCounters);
        Ok(())
    }

    fn enqueue_search(&mut self, start_nonce: u64) -> Result<(), DeviceError> {
        self.state.record(MockOp::Enqueue { start_nonce });
        Ok(())
    }

    fn read_search_results(&mut self) -> Result<SearchReadback, DeviceError> {
        self.state.record(MockOp::ReadResults);
        Ok(self.state.next_result())
    }

    fn request_search_results(&mut self) -> Result<(), DeviceError> {
        self.state.record(MockOp::RequestResults);
        Ok(())
    }

    fn wait_search_results(&mut self) -> Result<SearchReadback, DeviceError> {
        self.state.record(MockOp::WaitResults);
        Ok(self.state.next_result())
    }

    fn abort_handle(&self) -> Arc<dyn DeviceAbort> {
        Arc::new(MockAbort {
            state: Arc::clone(&self.state),
        })
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.state.record(MockOp::Flush);
        Ok(())
    }
}

pub struct MockAbort {
    state: Arc<MockState>,
}

impl DeviceAbort for MockAbort {
    fn signal(&self) -> Result<(), DeviceError> {
        self.state.aborts.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

pub fn test_identity(platform: PlatformKind) -> DeviceIdentity {
    DeviceIdentity {
        platform,
        unique_id: "00:02.0".to_owned(),
        name: format!("Mock {platform:?}"),
        compute: (platform == PlatformKind::Nvidia)
            .then_some(ComputeCapability { major: 6, minor: 1 }),
        total_memory: 8 << 30,
        max_work_group_size: 256,
        compute_units: 20,
    }
}

/// Readback with `nonces` occupying the leading result slots. Counts larger
/// than the slot array are allowed so overflow handling can be exercised.
pub fn scripted_readback(rounds: u32, nonces: &[u64]) -> SearchReadback {
    let mut readback = SearchReadback {
        count: nonces.len() as u32,
        rounds,
        ..SearchReadback::default()
    };
    for (slot, nonce) in readback.found.iter_mut().zip(nonces) {
        slot.nonce = *nonce;
        slot.mix = [(*nonce & 0xff) as u8; 32];
    }
    readback
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
