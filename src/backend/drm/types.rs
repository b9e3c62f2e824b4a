//! Per-frame inputs and outputs of the DRM interface.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use super::format::Compression;
use super::props::BlendMode;

// =============================================================================
// Identifiers
// =============================================================================

/// Stable id of a composition layer, assigned by the composition pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u64);

/// What a cached framebuffer was created for.
///
/// Layers are referenced by id only; the composition pipeline calls
/// [`FramebufferManager::cleanup`](super::framebuffer::FramebufferManager::cleanup) when a
/// layer goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FbOwner {
    /// The GPU/G2D composition target.
    ClientTarget,
    Layer(LayerId),
    Writeback,
}

// =============================================================================
// Window configs
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

/// A dma-buf backed graphics buffer.
#[derive(Debug, Clone)]
pub struct BufferInfo {
    /// Unique id of the buffer allocation, stable across frames.
    pub id: u64,
    /// One fd per memory plane. Single-fd multi-plane formats carry one entry.
    pub fds: Vec<Arc<OwnedFd>>,
    pub width: u32,
    pub height: u32,
    /// Row stride in pixels.
    pub stride: u32,
    /// HAL pixel format.
    pub format: u32,
    pub compression: Compression,
    pub protected: bool,
}

#[derive(Debug, Clone, Default)]
pub enum WinConfigState {
    #[default]
    Disabled,
    /// A solid-colour layer, in ARGB8888.
    Color(u32),
    Buffer(BufferInfo),
}

/// One plane's worth of composition output for a frame.
#[derive(Debug, Clone)]
pub struct WinConfig {
    pub state: WinConfigState,
    pub owner: FbOwner,
    /// Index into the interface's plane list.
    pub plane: usize,
    pub src: Rect,
    pub dst: Rect,
    pub transform: u32,
    pub blending: BlendMode,
    /// 0.0 to 1.0.
    pub plane_alpha: f32,
    pub dataspace: u32,
    pub min_luminance: u32,
    pub max_luminance: u32,
    pub acquire_fence: Option<Arc<OwnedFd>>,
    pub composed_by_g2d: bool,
}

impl WinConfig {
    pub fn new(owner: FbOwner, plane: usize, state: WinConfigState) -> Self {
        Self {
            state,
            owner,
            plane,
            src: Rect::default(),
            dst: Rect::default(),
            transform: 0,
            blending: BlendMode::Premultiplied,
            plane_alpha: 1.0,
            dataspace: 0,
            min_luminance: 0,
            max_luminance: 0,
            acquire_fence: None,
            composed_by_g2d: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.state, WinConfigState::Disabled)
    }

    pub fn is_protected(&self) -> bool {
        matches!(&self.state, WinConfigState::Buffer(buffer) if buffer.protected)
    }
}

// =============================================================================
// Frame
// =============================================================================

/// Everything the interface needs to commit one frame.
#[derive(Debug, Default)]
pub struct Frame {
    pub configs: Vec<WinConfig>,
    /// Buffer to read the composed frame back into.
    pub readback: Option<BufferInfo>,
    /// Damaged area for panel self-refresh; `None` means the full screen.
    pub partial_region: Option<Rect>,
    /// Set when some layers were composed by the GPU and some scanned out directly.
    pub mixed_composition: bool,
}

/// Fences returned by a successful frame commit.
#[derive(Debug, Default)]
pub struct FrameFences {
    /// Signalled when this frame is replaced on screen.
    pub retire: Option<Arc<OwnedFd>>,
    /// Release fence per config index; duplicated from the retire fence for enabled buffers.
    pub release: Vec<Option<Arc<OwnedFd>>>,
    pub readback: Option<OwnedFd>,
}

/// Display power modes, as reported by the composition pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerMode {
    #[default]
    Off,
    Doze,
    DozeSuspend,
    On,
}

impl PowerMode {
    pub fn is_on(self) -> bool {
        self != PowerMode::Off
    }
}
