//! Collaborators the DRM interface talks to, selected per SoC at construction time.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::drm::atomic::AtomicReq;
use crate::error::Result;

/// Upward notifications to the composition pipeline.
pub trait DisplayEventListener: Send + Sync {
    fn on_vsync(&self, display_id: u32, timestamp: Duration, vsync_period_ns: u64);

    /// A config set with `set_active_config()` is now on screen.
    fn on_config_applied(&self, display_id: u32, config_id: u32, timestamp: Duration);

    /// The display has state that only reaches the panel with the next frame.
    fn on_refresh_requested(&self, display_id: u32);
}

/// Colour pipeline hooks.
pub trait DisplayColorCapable: Send + Sync {
    /// Backlight level the colour pipeline wants while local HBM is on, given the current one.
    fn lhbm_adjusted_brightness_level(&self, level: u32) -> Option<u32>;
}

/// The optional collaborators of one display, picked per SoC by the caller.
#[derive(Clone, Default)]
pub struct DisplayCollaborators {
    pub listener: Option<Arc<dyn DisplayEventListener>>,
    pub color: Option<Arc<dyn DisplayColorCapable>>,
    pub histogram: Option<Arc<dyn HistogramCapable>>,
}

/// Histogram sampling hooks.
pub trait HistogramCapable: Send + Sync {
    /// Adds this frame's histogram properties to the commit.
    fn prepare_histogram_commit(&self, crtc_id: u32, req: &mut AtomicReq<'_>) -> Result<()>;

    fn on_commit_done(&self, success: bool);
}
