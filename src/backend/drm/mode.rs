use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::atomic::AtomicReq;

const DRM_MODE_FLAG_INTERLACE: u32 = 1 << 4;
const DRM_MODE_FLAG_DBLSCAN: u32 = 1 << 5;

/// Kernel `struct drm_mode_modeinfo`, the payload of a `MODE_ID` blob.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: [u8; 32],
}

impl ModeInfo {
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Time between two vblanks for this timing.
    pub fn refresh_interval(&self) -> Duration {
        if self.clock == 0 {
            return Duration::ZERO;
        }

        let mut numerator = u64::from(self.htotal) * u64::from(self.vtotal) * 1_000_000;
        let mut denominator = u64::from(self.clock);

        if self.flags & DRM_MODE_FLAG_INTERLACE != 0 {
            denominator *= 2;
        }

        if self.flags & DRM_MODE_FLAG_DBLSCAN != 0 {
            numerator *= 2;
        }

        if self.vscan > 1 {
            numerator *= u64::from(self.vscan);
        }

        Duration::from_nanos((numerator + denominator / 2) / denominator)
    }
}

impl fmt::Debug for ModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeInfo")
            .field("name", &self.name())
            .field("clock", &self.clock)
            .field("hdisplay", &self.hdisplay)
            .field("vdisplay", &self.vdisplay)
            .field("htotal", &self.htotal)
            .field("vtotal", &self.vtotal)
            .field("vrefresh", &self.vrefresh)
            .field("flags", &self.flags)
            .finish()
    }
}

/// A connector mode exposed as a display config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub id: u32,
    pub info: ModeInfo,
}

impl DisplayMode {
    pub fn width(&self) -> u32 {
        u32::from(self.info.hdisplay)
    }

    pub fn height(&self) -> u32 {
        u32::from(self.info.vdisplay)
    }

    pub fn refresh_rate(&self) -> u32 {
        self.info.vrefresh
    }

    pub fn vsync_period_ns(&self) -> u64 {
        self.info.refresh_interval().as_nanos() as u64
    }

    fn same_resolution(&self, other: &DisplayMode) -> bool {
        self.info.hdisplay == other.info.hdisplay && self.info.vdisplay == other.info.vdisplay
    }
}

/// Builds display configs from the connector's mode list. Ids start at 1.
pub fn display_modes(infos: &[ModeInfo]) -> Vec<DisplayMode> {
    infos
        .iter()
        .zip(1..)
        .map(|(info, id)| DisplayMode { id, info: *info })
        .collect()
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModeChange: u32 {
        const REFRESH_RATE = 1 << 0;
        const RESOLUTION = 1 << 1;
        const FORCE_MODE_SET = 1 << 2;
    }
}

/// A mode together with the blob carrying it.
///
/// The interface keeps two of these: the desired state set by `set_active_config()` and the
/// active state of the last commit. Blobs that fall out of either are queued on an atomic
/// request so they are destroyed only once that request has been resolved.
#[derive(Debug, Default)]
pub struct ModeState {
    pub mode: Option<DisplayMode>,
    pub blob_id: u32,
    old_blob_id: u32,
    changes: ModeChange,
}

impl ModeState {
    pub fn set_mode(&mut self, mode: DisplayMode, blob_id: u32, req: &mut AtomicReq<'_>) {
        match &self.mode {
            Some(current) => {
                if current.info.vrefresh != mode.info.vrefresh {
                    self.changes |= ModeChange::REFRESH_RATE;
                }
                if !current.same_resolution(&mode) {
                    self.changes |= ModeChange::RESOLUTION;
                }
            }
            None => self.changes |= ModeChange::REFRESH_RATE | ModeChange::RESOLUTION,
        }

        req.add_old_blob(self.old_blob_id);
        self.mode = Some(mode);
        self.old_blob_id = self.blob_id;
        self.blob_id = blob_id;
    }

    /// Like [`ModeState::set_mode`], but the first pending mode is compared against `active`.
    pub fn set_desired_mode(
        &mut self,
        active: &ModeState,
        mode: DisplayMode,
        blob_id: u32,
        req: &mut AtomicReq<'_>,
    ) {
        if self.mode.is_none() {
            self.mode = active.mode;
        }
        self.set_mode(mode, blob_id, req);
    }

    /// Moves this (desired) state into `active` and resets self.
    pub fn apply(&mut self, active: &mut ModeState, req: &mut AtomicReq<'_>) {
        if let Some(mode) = self.mode {
            active.set_mode(mode, self.blob_id, req);
        }
        req.add_old_blob(self.old_blob_id);
        *self = ModeState::default();
    }

    /// Queues every blob held by this state for destruction and resets it.
    pub fn clear(&mut self, req: &mut AtomicReq<'_>) {
        req.add_old_blob(self.blob_id);
        req.add_old_blob(self.old_blob_id);
        *self = ModeState::default();
    }

    pub fn needs_mode_set(&self) -> bool {
        self.mode.is_some() || self.changes.contains(ModeChange::FORCE_MODE_SET)
    }

    /// A refresh-rate-only switch can be applied without `ALLOW_MODESET`.
    pub fn is_seamless(&self) -> bool {
        !self
            .changes
            .intersects(ModeChange::RESOLUTION | ModeChange::FORCE_MODE_SET)
    }

    pub fn force_mode_set(&mut self) {
        self.changes |= ModeChange::FORCE_MODE_SET;
    }

    pub fn changes(&self) -> ModeChange {
        self.changes
    }

    pub fn clear_pending_changes(&mut self) {
        self.changes = ModeChange::empty();
    }
}

#[cfg(test)]
pub(crate) fn test_mode_info(width: u16, height: u16, refresh: u32) -> ModeInfo {
    let htotal = width + 160;
    let vtotal = height + 40;
    let clock = u32::from(htotal) * u32::from(vtotal) * refresh / 1000;
    let mut name = [0u8; 32];
    let text = format!("{width}x{height}");
    name[..text.len()].copy_from_slice(text.as_bytes());

    ModeInfo {
        clock,
        hdisplay: width,
        hsync_start: width + 40,
        hsync_end: width + 80,
        htotal,
        hskew: 0,
        vdisplay: height,
        vsync_start: height + 10,
        vsync_end: height + 20,
        vtotal,
        vscan: 0,
        vrefresh: refresh,
        flags: 0,
        type_: 0,
        name,
    }
}
