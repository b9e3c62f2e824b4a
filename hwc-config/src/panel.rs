use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BACKLIGHT_ROOT: &str = "/sys/class/backlight";
const DEFAULT_HBM_DIMMING_TIME_MS: u64 = 5000;
const DEFAULT_SYSFS_CHECK_TIMEOUT_MS: u64 = 200;
const DEFAULT_LHBM_POWER_ON_TIMEOUT_MS: u64 = 2000;
const DEFAULT_LHBM_PEAK_REFRESH_TIMEOUT_MS: u64 = 200;
const DEFAULT_LHBM_STATUS_TIMEOUT_MS: u64 = 500;

/// Panel and backlight settings.
#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Panel {
    /// Selects `panelN-backlight` under the backlight root.
    #[knuffel(child, unwrap(argument), default)]
    pub index: u32,
    #[knuffel(child, unwrap(argument), default = PathBuf::from(DEFAULT_BACKLIGHT_ROOT))]
    pub backlight_root: PathBuf,
    #[knuffel(child, unwrap(argument), default)]
    pub brightness_dimming_usage: DimmingUsage,
    /// How long dimming stays on after a global HBM transition with [`DimmingUsage::Hbm`].
    #[knuffel(child, unwrap(argument), default = DEFAULT_HBM_DIMMING_TIME_MS)]
    pub hbm_dimming_time_ms: u64,
    #[knuffel(child, unwrap(argument), default = DEFAULT_SYSFS_CHECK_TIMEOUT_MS)]
    pub sysfs_check_timeout_ms: u64,
    #[knuffel(child, unwrap(argument), default = DEFAULT_LHBM_POWER_ON_TIMEOUT_MS)]
    pub lhbm_power_on_timeout_ms: u64,
    #[knuffel(child, unwrap(argument), default = DEFAULT_LHBM_PEAK_REFRESH_TIMEOUT_MS)]
    pub lhbm_peak_refresh_timeout_ms: u64,
    #[knuffel(child, unwrap(argument), default = DEFAULT_LHBM_STATUS_TIMEOUT_MS)]
    pub lhbm_status_timeout_ms: u64,
}

/// When the panel's brightness dimming (smooth ramp) is enabled.
#[derive(knuffel::DecodeScalar, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DimmingUsage {
    /// Dimming is always on, except for instant HBM and mixed-composition transitions.
    #[default]
    Normal,
    /// Dimming is only on for a limited time after a global HBM transition.
    Hbm,
    /// Dimming is never on.
    None,
}

impl Default for Panel {
    fn default() -> Self {
        Self {
            index: 0,
            backlight_root: PathBuf::from(DEFAULT_BACKLIGHT_ROOT),
            brightness_dimming_usage: DimmingUsage::default(),
            hbm_dimming_time_ms: DEFAULT_HBM_DIMMING_TIME_MS,
            sysfs_check_timeout_ms: DEFAULT_SYSFS_CHECK_TIMEOUT_MS,
            lhbm_power_on_timeout_ms: DEFAULT_LHBM_POWER_ON_TIMEOUT_MS,
            lhbm_peak_refresh_timeout_ms: DEFAULT_LHBM_PEAK_REFRESH_TIMEOUT_MS,
            lhbm_status_timeout_ms: DEFAULT_LHBM_STATUS_TIMEOUT_MS,
        }
    }
}

impl Panel {
    /// Directory holding the panel's backlight nodes, e.g. `/sys/class/backlight/panel0-backlight`.
    pub fn backlight_dir(&self) -> PathBuf {
        self.backlight_root
            .join(format!("panel{}-backlight", self.index))
    }

    pub fn hbm_dimming_time(&self) -> Duration {
        Duration::from_millis(self.hbm_dimming_time_ms)
    }

    pub fn sysfs_check_timeout(&self) -> Duration {
        Duration::from_millis(self.sysfs_check_timeout_ms)
    }

    pub fn lhbm_power_on_timeout(&self) -> Duration {
        Duration::from_millis(self.lhbm_power_on_timeout_ms)
    }

    pub fn lhbm_peak_refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.lhbm_peak_refresh_timeout_ms)
    }

    pub fn lhbm_status_timeout(&self) -> Duration {
        Duration::from_millis(self.lhbm_status_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlight_dir_uses_panel_index() {
        let panel = Panel {
            index: 1,
            ..Panel::default()
        };
        assert_eq!(
            panel.backlight_dir(),
            PathBuf::from("/sys/class/backlight/panel1-backlight")
        );
    }
}
