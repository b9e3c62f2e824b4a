//! Process-wide configuration and diagnostics shared by every display.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hwc_config::Config;
use tracing::{debug, warn};

use crate::utils::get_monotonic_time;

/// Value of the DRM module `debug` parameter that turns on atomic state messages.
const DRM_DEBUG_ATOMIC: u32 = 16;

pub struct HwcContext {
    config: Config,
    /// Set while the kernel display pipe is in a trusted-UI session.
    tui_active: AtomicBool,
    commits: AtomicU64,
    failed_commits: AtomicU64,
    drm_debug: Mutex<DrmDebugMessages>,
}

#[derive(Debug, Default)]
struct DrmDebugMessages {
    enabled: bool,
    last_enabled_at: Option<Duration>,
}

/// Snapshot of the commit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitStats {
    pub commits: u64,
    pub failed_commits: u64,
}

impl HwcContext {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            tui_active: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            failed_commits: AtomicU64::new(0),
            drm_debug: Mutex::new(DrmDebugMessages::default()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_tui_active(&self) -> bool {
        self.tui_active.load(Ordering::Acquire)
    }

    /// Updated by the kernel event listener when a trusted-UI session starts or ends.
    pub fn set_tui_active(&self, active: bool) {
        debug!("trusted UI {}", if active { "entered" } else { "exited" });
        self.tui_active.store(active, Ordering::Release);
    }

    pub fn atomic_commit_logging(&self) -> bool {
        self.config.debug.atomic_commit_logging
    }

    pub(crate) fn record_commit(&self, success: bool) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_commits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn commit_stats(&self) -> CommitStats {
        CommitStats {
            commits: self.commits.load(Ordering::Relaxed),
            failed_commits: self.failed_commits.load(Ordering::Relaxed),
        }
    }

    /// Turns on kernel atomic debug messages after a failed commit, rate limited.
    pub(crate) fn enable_drm_debug_messages(&self, err: i32) {
        let cfg = &self.config.debug;
        let mut state = self.drm_debug.lock().unwrap_or_else(|e| e.into_inner());

        let now = get_monotonic_time();
        if let Some(last) = state.last_enabled_at {
            if now.saturating_sub(last) < cfg.drm_debug_dump_interval() {
                return;
            }
        }

        if let Err(write_err) = fs::write(&cfg.drm_debug_node, DRM_DEBUG_ATOMIC.to_string()) {
            warn!(
                "error enabling DRM debug messages at {:?}: {write_err}",
                cfg.drm_debug_node
            );
            return;
        }

        warn!("commit error {err}, enabled DRM atomic debug messages");
        state.enabled = true;
        state.last_enabled_at = Some(now);
    }

    /// Turns kernel debug messages back off once a commit went through.
    pub(crate) fn disable_drm_debug_messages(&self) {
        let mut state = self.drm_debug.lock().unwrap_or_else(|e| e.into_inner());
        if !state.enabled {
            return;
        }

        let node = &self.config.debug.drm_debug_node;
        match fs::write(node, "0") {
            Ok(()) => state.enabled = false,
            Err(err) => warn!("error disabling DRM debug messages at {node:?}: {err}"),
        }
    }
}
