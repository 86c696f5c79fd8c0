use std::fmt::Write as _;
use std::time::Instant;

use log::{debug, info, warn};

use crate::cache::{KernelCache, KernelSelector};
use crate::config::SearchSettings;
use crate::device::{DeviceError, PlatformKind, SearchDevice, MAX_SEARCH_RESULTS};

const LOG_TARGET: &str = "dredge::compile";

/// Inputs that specialize one search-kernel build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelBuild {
    pub period: u32,
    pub dag_bytes: u64,
    pub dag_items: u32,
}

/// Supplies the period-specialized search program text. The back-end treats
/// the text as opaque; it only prepends the macro block.
pub trait KernelSourceProvider: Send + Sync {
    fn search_source(&self, period: u32, dag_items: u32) -> String;
}

/// Loads the kernel for `build` onto the device, compiling and caching it
/// first if no compatible binary exists yet.
pub fn ensure_search_kernel<D>(
    device: &mut D,
    cache: &KernelCache,
    provider: &dyn KernelSourceProvider,
    settings: &SearchSettings,
    build: &KernelBuild,
) -> Result<(), DeviceError>
where
    D: SearchDevice + ?Sized,
{
    let selector = KernelSelector::for_device(device.identity());
    cache.note_requested(build.period);

    if let Some(binary) = cache.lookup(&selector, build.period) {
        return device.load_search_program(&binary);
    }

    compile_search_kernel(device, cache, provider, settings, build, &selector)?;

    let binary = cache
        .lookup(&selector, build.period)
        .ok_or_else(|| DeviceError::Api("compiled kernel missing from cache".to_owned()))?;
    device.load_search_program(&binary)
}

/// Compiles the kernel for `build` and inserts the binary into the cache,
/// unless another worker finished the same build first. The global build
/// guard is held across the vendor compiler call only; stale entries are
/// evicted before taking it.
pub(crate) fn compile_search_kernel<D>(
    device: &mut D,
    cache: &KernelCache,
    provider: &dyn KernelSourceProvider,
    settings: &SearchSettings,
    build: &KernelBuild,
    selector: &KernelSelector,
) -> Result<(), DeviceError>
where
    D: SearchDevice + ?Sized,
{
    cache.evict_stale();

    let _build_lock = cache.build_guard();
    if cache.lookup(selector, build.period).is_some() {
        debug!(
            target: LOG_TARGET,
            "period {} kernel was compiled by another worker while waiting", build.period
        );
        return Ok(());
    }

    let (device_name, options, source) = {
        let identity = device.identity();
        (
            identity.name.clone(),
            (identity.platform.policy().build_options)(identity),
            assemble_search_source(provider, settings, identity.platform, build),
        )
    };

    info!(
        target: LOG_TARGET,
        "compiling search kernel at period {} for {device_name}", build.period
    );
    let started = Instant::now();
    let binary = match device.build_search_program(&source, &options) {
        Ok(binary) => binary,
        Err(err) => {
            warn!(
                target: LOG_TARGET,
                "search kernel build failed at period {} for {device_name}: {err}", build.period
            );
            return Err(err);
        }
    };
    info!(
        target: LOG_TARGET,
        "compiled search kernel at period {} in {} ms",
        build.period,
        started.elapsed().as_millis()
    );

    cache.insert(selector.clone(), build.period, binary);
    Ok(())
}

/// Prepends the numeric macro block to the provider's program text: group
/// size, working-set bytes and the result-slot count first, then the platform
/// tag.
pub(crate) fn assemble_search_source(
    provider: &dyn KernelSourceProvider,
    settings: &SearchSettings,
    platform: PlatformKind,
    build: &KernelBuild,
) -> String {
    let mut source = String::new();
    push_define(&mut source, "GROUP_SIZE", settings.local_work_size);
    push_define(&mut source, "PROGPOW_DAG_BYTES", build.dag_bytes as u32);
    push_define(&mut source, "MAX_SEARCH_RESULTS", MAX_SEARCH_RESULTS);
    push_define(&mut source, "PLATFORM", platform.policy().platform_define);
    source.push_str(&provider.search_source(build.period, build.dag_items));
    source
}

pub(crate) fn push_define(source: &mut String, name: &str, value: u32) {
    // Infallible for String, the Write trait just wants a Result.
    let _ = writeln!(source, "#define {name} {value}u");
}
