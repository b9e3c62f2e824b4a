use std::fmt;

/// Content-adaptive backlight control modes, as written to the `cabc_mode` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CabcMode {
    #[default]
    Off = 0,
    User = 1,
    Still = 2,
    Movie = 3,
}

impl fmt::Display for CabcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u32)
    }
}

/// Panel features detected from the connector properties and sysfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrightnessCaps {
    pub lhbm: bool,
    pub ghbm: bool,
    pub dimming: bool,
    pub cabc: bool,
    pub dim_brightness: bool,
}

/// Which panel commands a frame carries that need to land together with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSyncFlags {
    pub ghbm: bool,
    pub lhbm: bool,
    pub backlight: bool,
}

impl FrameSyncFlags {
    pub fn any(&self) -> bool {
        self.ghbm || self.lhbm || self.backlight
    }
}
