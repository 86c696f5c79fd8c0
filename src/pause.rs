use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use serde::{Deserialize, Serialize};

const LOG_TARGET: &str = "dredge::pause";

/// Why a device is not mining. Reasons are orthogonal; a device resumes only
/// once every held reason clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PauseReason {
    InsufficientMemory,
    EpochInitError,
    UserRequest,
    Overheat,
}

impl PauseReason {
    const ALL: [PauseReason; 4] = [
        PauseReason::InsufficientMemory,
        PauseReason::EpochInitError,
        PauseReason::UserRequest,
        PauseReason::Overheat,
    ];

    fn bit(self) -> u32 {
        match self {
            PauseReason::InsufficientMemory => 1,
            PauseReason::EpochInitError => 1 << 1,
            PauseReason::UserRequest => 1 << 2,
            PauseReason::Overheat => 1 << 3,
        }
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PauseReason::InsufficientMemory => "insufficient device memory",
            PauseReason::EpochInitError => "epoch initialization error",
            PauseReason::UserRequest => "paused by user",
            PauseReason::Overheat => "device overheated",
        };
        f.write_str(text)
    }
}

/// Set-valued pause flags. Flags, not counters: pausing twice and resuming
/// once clears the reason.
#[derive(Debug, Default)]
pub struct PauseController {
    flags: AtomicU32,
}

impl PauseController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self, reason: PauseReason) {
        let prior = self.flags.fetch_or(reason.bit(), Ordering::AcqRel);
        if prior & reason.bit() == 0 {
            debug!(target: LOG_TARGET, "paused: {reason}");
        }
    }

    pub fn resume(&self, reason: PauseReason) {
        let prior = self.flags.fetch_and(!reason.bit(), Ordering::AcqRel);
        if prior & reason.bit() != 0 {
            debug!(target: LOG_TARGET, "resumed: {reason}");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.flags.load(Ordering::Acquire) != 0
    }

    pub fn holds(&self, reason: PauseReason) -> bool {
        self.flags.load(Ordering::Acquire) & reason.bit() != 0
    }

    pub fn reasons(&self) -> Vec<PauseReason> {
        let flags = self.flags.load(Ordering::Acquire);
        PauseReason::ALL
            .into_iter()
            .filter(|reason| flags & reason.bit() != 0)
            .collect()
    }
}
