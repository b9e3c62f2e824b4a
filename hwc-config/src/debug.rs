use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DRM_DEBUG_NODE: &str = "/sys/module/drm/parameters/debug";

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Debug {
    /// Dump every atomic commit's property table at debug level.
    #[knuffel(child)]
    pub atomic_commit_logging: bool,
    /// DRM module debug parameter, used to turn on kernel atomic messages after a failed commit.
    #[knuffel(child, unwrap(argument), default = PathBuf::from(DEFAULT_DRM_DEBUG_NODE))]
    pub drm_debug_node: PathBuf,
    #[knuffel(child, unwrap(argument), default = 5000)]
    pub drm_debug_dump_interval_ms: u64,
}

impl Default for Debug {
    fn default() -> Self {
        Self {
            atomic_commit_logging: false,
            drm_debug_node: PathBuf::from(DEFAULT_DRM_DEBUG_NODE),
            drm_debug_dump_interval_ms: 5000,
        }
    }
}

impl Debug {
    pub fn drm_debug_dump_interval(&self) -> Duration {
        Duration::from_millis(self.drm_debug_dump_interval_ms)
    }
}
