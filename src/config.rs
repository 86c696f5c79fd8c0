use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Work items per group handed to every kernel dispatch.
pub const DEFAULT_LOCAL_WORK_SIZE: u32 = 128;
/// Global work size is the local work size times this multiplier.
pub const DEFAULT_GLOBAL_WORK_MULTIPLIER: u32 = 8192;
/// DAG generation dispatches this many work groups per chunk.
pub const DEFAULT_DAG_CHUNK_GROUPS: u32 = 10240;
/// Cached kernels more than this many periods behind the latest requested
/// period are evicted.
pub const DEFAULT_EVICTION_LOOKBACK: u32 = 2;
/// Fraction of the expected kernel time slept before the completion wait on
/// runtimes that busy-wait in blocking reads.
pub const DEFAULT_SLEEP_RATIO: f64 = 0.9;
/// Weight of the previous average in the kernel round-trip EMA.
pub const DEFAULT_EMA_ALPHA: f64 = 0.9;

/// Tunables for one device worker. The defaults fit discrete GPUs; embedders
/// can override per device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub local_work_size: u32,
    pub global_work_multiplier: u32,
    pub dag_chunk_groups: u32,
    pub eviction_lookback: u32,
    pub sleep_ratio: f64,
    pub ema_alpha: f64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            local_work_size: DEFAULT_LOCAL_WORK_SIZE,
            global_work_multiplier: DEFAULT_GLOBAL_WORK_MULTIPLIER,
            dag_chunk_groups: DEFAULT_DAG_CHUNK_GROUPS,
            eviction_lookback: DEFAULT_EVICTION_LOOKBACK,
            sleep_ratio: DEFAULT_SLEEP_RATIO,
            ema_alpha: DEFAULT_EMA_ALPHA,
        }
    }
}

impl SearchSettings {
    /// Work items claimed by one search dispatch, which is also the stride
    /// between consecutive start nonces.
    pub fn global_work_size(&self) -> u64 {
        u64::from(self.local_work_size) * u64::from(self.global_work_multiplier)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_work_size == 0 {
            bail!("local_work_size must be non-zero");
        }
        if self.global_work_multiplier == 0 {
            bail!("global_work_multiplier must be non-zero");
        }
        if self.dag_chunk_groups == 0 {
            bail!("dag_chunk_groups must be non-zero");
        }
        if !(self.sleep_ratio > 0.0 && self.sleep_ratio < 1.0) {
            bail!("sleep_ratio must be in (0, 1)");
        }
        if !(self.ema_alpha >= 0.0 && self.ema_alpha < 1.0) {
            bail!("ema_alpha must be in [0, 1)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = SearchSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.local_work_size, DEFAULT_LOCAL_WORK_SIZE);
        assert_eq!(settings.eviction_lookback, DEFAULT_EVICTION_LOOKBACK);
    }

    #[test]
    fn global_work_size_multiplies() {
        let settings = SearchSettings {
            local_work_size: 64,
            global_work_multiplier: 4096,
            ..SearchSettings::default()
        };
        assert_eq!(settings.global_work_size(), 64 * 4096);
    }

    #[test]
    fn validate_rejects_degenerate_values() {
        let mut settings = SearchSettings::default();
        settings.local_work_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = SearchSettings::default();
        settings.sleep_ratio = 1.0;
        assert!(settings.validate().is_err());

        let mut settings = SearchSettings::default();
        settings.ema_alpha = 1.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let settings: SearchSettings =
            serde_json::from_str(r#"{"local_work_size": 256}"#).expect("parse settings");
        assert_eq!(settings.local_work_size, 256);
        assert_eq!(settings.global_work_multiplier, DEFAULT_GLOBAL_WORK_MULTIPLIER);
        assert_eq!(settings.sleep_ratio, DEFAULT_SLEEP_RATIO);
    }
}
