//! KDL configuration for the Exynos DRM composer backend.
//!
//! Every section is optional; a missing file yields [`Config::default()`].

use std::path::{Path, PathBuf};

use miette::{IntoDiagnostic, WrapErr};
use tracing::debug;

pub mod debug;
pub mod framebuffer;
pub mod panel;

pub use crate::debug::Debug;
pub use crate::framebuffer::FramebufferLimits;
pub use crate::panel::{DimmingUsage, Panel};

/// Location of the config file when nothing else is specified.
pub const DEFAULT_CONFIG_PATH: &str = "/vendor/etc/exynos-hwc.kdl";

/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "EXYNOS_HWC_CONFIG";

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Config {
    #[knuffel(child, default)]
    pub panel: Panel,
    #[knuffel(child, default)]
    pub framebuffer: FramebufferLimits,
    #[knuffel(child, default)]
    pub debug: Debug,
}

impl Config {
    /// Parses config text. `filename` is only used for error reporting.
    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        knuffel::parse(filename, text)
    }

    /// Loads the config from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> miette::Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("config file {path:?} not found, using defaults");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err)
                    .into_diagnostic()
                    .wrap_err_with(|| format!("error reading {path:?}"));
            }
        };

        let name = path.to_string_lossy();
        let config = Self::parse(&name, &text)?;
        debug!("loaded config from {path:?}");
        Ok(config)
    }

    /// Resolves the config path: explicit argument, then environment, then the default.
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use insta::assert_debug_snapshot;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_config_is_default() {
        let config = Config::parse("test.kdl", "").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parse_full_config() {
        let config = Config::parse(
            "test.kdl",
            r#"
            panel {
                index 1
                backlight-root "/tmp/backlight"
                brightness-dimming-usage "none"
                hbm-dimming-time-ms 2500
                sysfs-check-timeout-ms 100
            }
            framebuffer {
                max-cached-layers 8
            }
            debug {
                atomic-commit-logging
                drm-debug-node "/tmp/drm-debug"
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.panel.index, 1);
        assert_eq!(config.panel.backlight_root, PathBuf::from("/tmp/backlight"));
        assert_eq!(config.panel.brightness_dimming_usage, DimmingUsage::None);
        assert_eq!(config.panel.hbm_dimming_time(), Duration::from_millis(2500));
        assert_eq!(config.panel.sysfs_check_timeout(), Duration::from_millis(100));
        assert_eq!(config.framebuffer.max_cached_layers, 8);
        assert_eq!(config.framebuffer.max_cached_buffers_per_layer, 32);
        assert!(config.debug.atomic_commit_logging);
        assert_eq!(config.debug.drm_debug_node, PathBuf::from("/tmp/drm-debug"));
    }

    #[test]
    fn default_values() {
        assert_debug_snapshot!(Config::default(), @r#"
        Config {
            panel: Panel {
                index: 0,
                backlight_root: "/sys/class/backlight",
                brightness_dimming_usage: Normal,
                hbm_dimming_time_ms: 5000,
                sysfs_check_timeout_ms: 200,
                lhbm_power_on_timeout_ms: 2000,
                lhbm_peak_refresh_timeout_ms: 200,
                lhbm_status_timeout_ms: 500,
            },
            framebuffer: FramebufferLimits {
                max_cached_layers: 16,
                max_cached_buffers_per_layer: 32,
                max_cached_secure_buffers_per_g2d_layer: 3,
            },
            debug: Debug {
                atomic_commit_logging: false,
                drm_debug_node: "/sys/module/drm/parameters/debug",
                drm_debug_dump_interval_ms: 5000,
            },
        }
        "#);
    }

    #[test]
    fn unknown_dimming_usage_is_an_error() {
        let err = Config::parse(
            "test.kdl",
            r#"panel { brightness-dimming-usage "sometimes"; }"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let config = Config::load(Path::new("/nonexistent/exynos-hwc.kdl")).unwrap();
        assert_eq!(config, Config::default());
    }
}
