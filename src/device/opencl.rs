//! OpenCL implementation of [`SearchDevice`], available behind the `opencl`
//! feature.
//!
//! One in-order queue carries all per-device traffic. A second queue exists
//! only so the abort word can be written while a search batch is still
//! running on the first one. Host-side waits on the main queue never hold
//! the result buffer lock, so an abort can always land.

use std::mem;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{Device as ClDevice, CL_DEVICE_TYPE_GPU};
use opencl3::error_codes::ClError;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer as ClBuffer, CL_MEM_READ_ONLY, CL_MEM_WRITE_ONLY};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{cl_device_id, CL_BLOCKING, CL_NON_BLOCKING};

use crate::compile::push_define;
use crate::config::SearchSettings;
use crate::device::{
    ComputeCapability, DeviceAbort, DeviceError, DeviceIdentity, PlatformKind, SearchDevice,
    SearchReadback, MAX_SEARCH_RESULTS,
};

const LOG_TARGET: &str = "dredge::opencl";

const DAG_KERNEL_NAME: &str = "ethash_calculate_dag_item";
const SEARCH_KERNEL_NAME: &str = "progpow_search";

/// Dataset accesses per hash, baked into the generation kernel.
const DAG_ACCESSES: u32 = 64;
/// The generation kernel indexes the cache in 64-byte nodes.
const LIGHT_NODE_BYTES: u64 = 64;

/// Device-side result block. The kernels write this exact layout; the block
/// starts with the result slots so the hot store in the kernel is a fixed
/// small offset.
#[repr(C)]
#[allow(dead_code)]
struct RawFound {
    nonce: u64,
    mix: [u32; 8],
    pad: [u32; 6],
}

#[repr(C)]
#[allow(dead_code)]
struct RawResults {
    found: [RawFound; MAX_SEARCH_RESULTS as usize],
    count: u32,
    rounds: u32,
    abort: u32,
}

const RESULTS_COUNT_OFFSET: usize = mem::offset_of!(RawResults, count);
const RESULTS_ABORT_OFFSET: usize = mem::offset_of!(RawResults, abort);
/// count, rounds and abort sit back to back and are cleared with one write.
const RESULT_COUNTER_BYTES: usize = 3 * mem::size_of::<u32>();
/// Source of the pipelined counter reset. The transfer can still be in
/// flight when the enqueue returns, so it must not be a stack local.
static COUNTER_RESET: [u8; RESULT_COUNTER_BYTES] = [0; RESULT_COUNTER_BYTES];

const _: () = assert!(RESULTS_ABORT_OFFSET == RESULTS_COUNT_OFFSET + 2 * mem::size_of::<u32>());
const _: () = assert!(mem::size_of::<RawFound>() == 64);

/// One discovered GPU, not yet opened.
pub struct DiscoveredDevice {
    identity: DeviceIdentity,
    device_id: cl_device_id,
}

/// Lists the GPUs of every OpenCL platform on this host.
///
/// The compute capability is left unset; the runtime offers it only through
/// a vendor extension, and a caller with NVML access can fill it in before
/// opening the device.
pub fn enumerate() -> Result<Vec<DiscoveredDevice>, DeviceError> {
    let platforms = get_platforms().map_err(api)?;
    let mut discovered = Vec::new();
    for (platform_index, platform) in platforms.iter().enumerate() {
        let platform_name = platform.name().map_err(api)?;
        let kind = classify_platform(&platform_name);
        let Ok(device_ids) = platform.get_devices(CL_DEVICE_TYPE_GPU) else {
            continue;
        };
        for (device_index, device_id) in device_ids.into_iter().enumerate() {
            let device = ClDevice::new(device_id);
            let identity = DeviceIdentity {
                platform: kind,
                unique_id: format!("{platform_index}:{device_index}"),
                name: device.name().map_err(api)?,
                compute: None,
                total_memory: device.global_mem_size().map_err(api)?,
                max_work_group_size: device.max_work_group_size().map_err(api)?,
                compute_units: device.max_compute_units().map_err(api)?,
            };
            debug!(
                target: LOG_TARGET,
                "found {} on {platform_name} ({} MB)",
                identity.name,
                identity.total_memory / (1024 * 1024)
            );
            discovered.push(DiscoveredDevice {
                identity,
                device_id,
            });
        }
    }
    Ok(discovered)
}

impl DiscoveredDevice {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn set_compute(&mut self, compute: ComputeCapability) {
        self.identity.compute = Some(compute);
    }

    /// Opens the device: context, the two queues, the static buffers and the
    /// dataset-generation program. `dag_source` is the generation kernel
    /// text without its macro block.
    pub fn open(
        self,
        settings: &SearchSettings,
        dag_source: &str,
    ) -> Result<ClSearchDevice, DeviceError> {
        let identity = self.identity;
        let device = ClDevice::new(self.device_id);
        let context = Context::from_device(&device).map_err(api)?;
        let queue = CommandQueue::create_default(&context, 0).map_err(api)?;
        let abort_queue = CommandQueue::create_default(&context, 0).map_err(api)?;

        let options = (identity.platform.policy().build_options)(&identity);
        let source = assemble_dag_source(&identity, settings, dag_source);
        let dag_program = build_program(&context, self.device_id, &source, &options)?;
        let dag_kernel = Kernel::create(&dag_program, DAG_KERNEL_NAME).map_err(api)?;

        let header = create_buffer(&context, CL_MEM_READ_ONLY, 32).map_err(api)?;
        let target =
            create_buffer(&context, CL_MEM_READ_ONLY, mem::size_of::<u64>()).map_err(api)?;
        let results =
            create_buffer(&context, CL_MEM_WRITE_ONLY, mem::size_of::<RawResults>()).map_err(api)?;
        let results = Arc::new(Mutex::new(results));
        let abort = Arc::new(ClAbortHandle {
            queue: abort_queue,
            results: Arc::clone(&results),
        });

        info!(
            target: LOG_TARGET,
            "opened {} ({} MB, {} compute units)",
            identity.name,
            identity.total_memory / (1024 * 1024),
            identity.compute_units
        );

        Ok(ClSearchDevice {
            local_work_size: settings.local_work_size as usize,
            global_work_size: settings.global_work_size() as usize,
            host_results: vec![0u8; mem::size_of::<RawResults>()].into_boxed_slice(),
            identity,
            device_id: self.device_id,
            context,
            queue,
            dag_kernel,
            _dag_program: dag_program,
            search_program: None,
            search_kernel: None,
            header,
            target,
            results,
            light: None,
            dag: None,
            light_nodes: 0,
            abort,
        })
    }
}

pub struct ClSearchDevice {
    identity: DeviceIdentity,
    device_id: cl_device_id,
    context: Context,
    queue: CommandQueue,
    dag_kernel: Kernel,
    _dag_program: Program,
    search_program: Option<Program>,
    search_kernel: Option<Kernel>,
    header: ClBuffer<u8>,
    target: ClBuffer<u8>,
    /// Shared with [`ClAbortHandle`]; held only across enqueue calls, never
    /// across a wait.
    results: Arc<Mutex<ClBuffer<u8>>>,
    light: Option<ClBuffer<u8>>,
    dag: Option<ClBuffer<u8>>,
    light_nodes: u32,
    host_results: Box<[u8]>,
    local_work_size: usize,
    global_work_size: usize,
    abort: Arc<ClAbortHandle>,
}

// The OpenCL runtime synchronizes access to its own objects.
unsafe impl Send for ClSearchDevice {}

impl SearchDevice for ClSearchDevice {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn build_search_program(&mut self, source: &str, options: &str) -> Result<Vec<u8>, DeviceError> {
        let program = build_program(&self.context, self.device_id, source, options)?;
        let mut binaries = program.get_binaries().map_err(api)?;
        binaries
            .pop()
            .ok_or_else(|| DeviceError::Api("compiler returned no program binary".to_owned()))
    }

    fn load_search_program(&mut self, binary: &[u8]) -> Result<(), DeviceError> {
        self.search_kernel = None;
        self.search_program = None;

        let mut program = unsafe {
            Program::create_from_binary(&self.context, &[self.device_id], &[binary])
                .map_err(api)?
        };
        if let Err(err) = program.build(&[self.device_id], "") {
            let log = program
                .get_build_log(self.device_id)
                .unwrap_or_else(|_| err.to_string());
            return Err(DeviceError::Build { log });
        }
        let kernel = Kernel::create(&program, SEARCH_KERNEL_NAME).map_err(api)?;

        debug!(
            target: LOG_TARGET,
            "loaded search program ({} bytes) on {}",
            binary.len(),
            self.identity.name
        );
        self.search_program = Some(program);
        self.search_kernel = Some(kernel);
        Ok(())
    }

    fn allocate_epoch_buffers(
        &mut self,
        light_bytes: u64,
        dag_bytes: u64,
    ) -> Result<(), DeviceError> {
        // Release the previous epoch first so both datasets are never
        // resident at once.
        self.light = None;
        self.dag = None;

        let oom = |err: ClError| DeviceError::OutOfMemory(err.to_string());
        self.light =
            Some(create_buffer(&self.context, CL_MEM_READ_ONLY, light_bytes as usize).map_err(oom)?);
        self.dag =
            Some(create_buffer(&self.context, CL_MEM_READ_ONLY, dag_bytes as usize).map_err(oom)?);
        self.light_nodes = (light_bytes / LIGHT_NODE_BYTES) as u32;
        Ok(())
    }

    fn upload_light_cache(&mut self, light: &[u8]) -> Result<(), DeviceError> {
        let Some(buffer) = self.light.as_mut() else {
            return Err(DeviceError::Api("light buffer not allocated".to_owned()));
        };
        unsafe {
            self.queue
                .enqueue_write_buffer(buffer, CL_BLOCKING, 0, light, &[])
                .map_err(api)?;
        }
        Ok(())
    }

    fn generate_dag_chunk(&mut self, start: u32, work_items: u32) -> Result<(), DeviceError> {
        let (Some(light), Some(dag)) = (self.light.as_ref(), self.dag.as_ref()) else {
            return Err(DeviceError::Api("epoch buffers not allocated".to_owned()));
        };
        unsafe {
            ExecuteKernel::new(&self.dag_kernel)
                .set_arg(&start)
                .set_arg(light)
                .set_arg(dag)
                .set_arg(&self.light_nodes)
                .set_arg(&u32::MAX)
                .set_global_work_size(work_items as usize)
                .set_local_work_size(self.local_work_size)
                .enqueue_nd_range(&self.queue)
                .map_err(api)?;
        }
        self.queue.finish().map_err(api)
    }

    fn write_search_header(&mut self, header: &[u8; 32]) -> Result<(), DeviceError> {
        unsafe {
            self.queue
                .enqueue_write_buffer(&mut self.header, CL_BLOCKING, 0, header, &[])
                .map_err(api)?;
        }
        Ok(())
    }

    fn write_search_target(&mut self, target: u64) -> Result<(), DeviceError> {
        let word = target.to_ne_bytes();
        unsafe {
            self.queue
                .enqueue_write_buffer(&mut self.target, CL_BLOCKING, 0, &word, &[])
                .map_err(api)?;
        }
        Ok(())
    }

    fn reset_search_counters(&mut self) -> Result<(), DeviceError> {
        let mut results = lock_results(&self.results);
        // The in-order queue lands this write before the next kernel reads
        // the block.
        unsafe {
            self.queue
                .enqueue_write_buffer(
                    &mut results,
                    CL_NON_BLOCKING,
                    RESULTS_COUNT_OFFSET,
                    &COUNTER_RESET,
                    &[],
                )
                .map_err(api)?;
        }
        Ok(())
    }

    fn enqueue_search(&mut self, start_nonce: u64) -> Result<(), DeviceError> {
        let Some(kernel) = self.search_kernel.as_ref() else {
            return Err(DeviceError::Api("search program not loaded".to_owned()));
        };
        let Some(dag) = self.dag.as_ref() else {
            return Err(DeviceError::Api("epoch buffers not allocated".to_owned()));
        };
        let results = lock_results(&self.results);
        unsafe {
            ExecuteKernel::new(kernel)
                .set_arg(&*results)
                .set_arg(&self.header)
                .set_arg(dag)
                .set_arg(&start_nonce)
                .set_arg(&self.target)
                .set_arg(&0u32)
                .set_global_work_size(self.global_work_size)
                .set_local_work_size(self.local_work_size)
                .enqueue_nd_range(&self.queue)
                .map_err(api)?;
        }
        Ok(())
    }

    fn read_search_results(&mut self) -> Result<SearchReadback, DeviceError> {
        self.request_search_results()?;
        self.wait_search_results()
    }

    fn request_search_results(&mut self) -> Result<(), DeviceError> {
        let results = lock_results(&self.results);
        unsafe {
            self.queue
                .enqueue_read_buffer(&results, CL_NON_BLOCKING, 0, &mut self.host_results, &[])
                .map_err(api)?;
        }
        Ok(())
    }

    fn wait_search_results(&mut self) -> Result<SearchReadback, DeviceError> {
        self.queue.finish().map_err(api)?;
        Ok(parse_results(&self.host_results))
    }

    fn abort_handle(&self) -> Arc<dyn DeviceAbort> {
        Arc::clone(&self.abort) as Arc<dyn DeviceAbort>
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.queue.finish().map_err(api)
    }
}

/// Writes the abort word from its own queue, past the batch occupying the
/// main one.
pub struct ClAbortHandle {
    queue: CommandQueue,
    results: Arc<Mutex<ClBuffer<u8>>>,
}

// The OpenCL runtime synchronizes access to its own objects.
unsafe impl Send for ClAbortHandle {}
unsafe impl Sync for ClAbortHandle {}

impl DeviceAbort for ClAbortHandle {
    fn signal(&self) -> Result<(), DeviceError> {
        let word = 1u32.to_ne_bytes();
        let mut results = lock_results(&self.results);
        unsafe {
            self.queue
                .enqueue_write_buffer(&mut results, CL_BLOCKING, RESULTS_ABORT_OFFSET, &word, &[])
                .map_err(api)?;
        }
        Ok(())
    }
}

fn classify_platform(platform_name: &str) -> PlatformKind {
    let lowered = platform_name.to_ascii_lowercase();
    if lowered.contains("nvidia") {
        PlatformKind::Nvidia
    } else if lowered.contains("amd") || lowered.contains("advanced micro devices") {
        PlatformKind::Amd
    } else if lowered.contains("clover") || lowered.contains("mesa") {
        PlatformKind::Clover
    } else {
        PlatformKind::Unknown
    }
}

/// The generation program is epoch- and period-independent, so its macro
/// block is fixed at open time.
fn assemble_dag_source(
    identity: &DeviceIdentity,
    settings: &SearchSettings,
    body: &str,
) -> String {
    let mut source = String::new();
    push_define(&mut source, "WORKSIZE", settings.local_work_size);
    push_define(&mut source, "ACCESSES", DAG_ACCESSES);
    push_define(&mut source, "MAX_SEARCH_RESULTS", MAX_SEARCH_RESULTS);
    push_define(&mut source, "PLATFORM", identity.platform.policy().platform_define);
    push_define(
        &mut source,
        "COMPUTE",
        identity.compute.map(ComputeCapability::level).unwrap_or(0),
    );
    if identity.platform == PlatformKind::Clover {
        source.push_str("#define LEGACY\n");
    }
    source.push_str(body);
    source
}

fn build_program(
    context: &Context,
    device_id: cl_device_id,
    source: &str,
    options: &str,
) -> Result<Program, DeviceError> {
    let mut program = Program::create_from_source(context, source).map_err(api)?;
    if let Err(err) = program.build(&[device_id], options) {
        let log = program
            .get_build_log(device_id)
            .unwrap_or_else(|_| err.to_string());
        return Err(DeviceError::Build { log });
    }
    Ok(program)
}

fn create_buffer(context: &Context, flags: u64, len: usize) -> Result<ClBuffer<u8>, ClError> {
    unsafe { ClBuffer::create(context, flags, len, ptr::null_mut()) }
}

fn parse_results(bytes: &[u8]) -> SearchReadback {
    let mut readback = SearchReadback {
        count: read_word(bytes, RESULTS_COUNT_OFFSET),
        rounds: read_word(bytes, RESULTS_COUNT_OFFSET + mem::size_of::<u32>()),
        ..SearchReadback::default()
    };
    for (index, slot) in readback.found.iter_mut().enumerate() {
        let base = index * mem::size_of::<RawFound>();
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&bytes[base..base + 8]);
        slot.nonce = u64::from_ne_bytes(nonce);
        let mix_at = base + mem::offset_of!(RawFound, mix);
        slot.mix.copy_from_slice(&bytes[mix_at..mix_at + 32]);
    }
    readback
}

fn read_word(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_ne_bytes(word)
}

fn lock_results(results: &Mutex<ClBuffer<u8>>) -> MutexGuard<'_, ClBuffer<u8>> {
    results.lock().unwrap_or_else(PoisonError::into_inner)
}

fn api(err: ClError) -> DeviceError {
    DeviceError::Api(err.to_string())
}
