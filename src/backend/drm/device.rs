//! The kernel DRM seam.
//!
//! Everything above this trait speaks in raw object/property ids and values, the same
//! vocabulary as the atomic ioctl. [`DrmCard`](super::card::DrmCard) implements it on top of a
//! real card node; tests use a recording fake.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::time::Duration;

use bitflags::bitflags;

use super::mode::ModeInfo;

bitflags! {
    /// `DRM_MODE_ATOMIC_*` and `DRM_MODE_PAGE_FLIP_*` commit flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AtomicFlags: u32 {
        const PAGE_FLIP_EVENT = 0x0001;
        const TEST_ONLY = 0x0100;
        const NONBLOCK = 0x0200;
        const ALLOW_MODESET = 0x0400;
    }
}

/// `DRM_MODE_FB_MODIFIERS`.
pub const FB_FLAG_MODIFIERS: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Crtc,
    Connector,
    Plane,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Range { min: u64, max: u64 },
    SignedRange { min: i64, max: i64 },
    /// Enum entries as `(name, value)`.
    Enum(Vec<(String, u64)>),
    /// Bitmask entries as `(name, bit index)`.
    Bitmask(Vec<(String, u64)>),
    Blob,
    Object,
    Other,
}

/// A property as advertised by the kernel, with its current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDesc {
    pub id: u32,
    pub name: String,
    pub value: u64,
    pub kind: PropertyKind,
    pub immutable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcDesc {
    pub id: u32,
    /// Index of the CRTC in the resource list, used for vblank waits.
    pub pipe: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorDesc {
    pub id: u32,
    pub writeback: bool,
    pub connected: bool,
    pub modes: Vec<ModeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneDesc {
    pub id: u32,
    /// Bitmask of CRTC pipes this plane can be attached to.
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KmsResources {
    pub crtcs: Vec<CrtcDesc>,
    pub connectors: Vec<ConnectorDesc>,
    pub planes: Vec<PlaneDesc>,
}

/// Arguments of `DRM_IOCTL_MODE_ADDFB2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramebufferSpec {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifiers: [u64; 4],
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicItem {
    pub object_id: u32,
    pub property_id: u32,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceSlot {
    /// CRTC `OUT_FENCE_PTR`, signalled when the frame is retired.
    Retire,
    /// Connector `WRITEBACK_OUT_FENCE_PTR`, signalled when readback completes.
    Writeback,
}

/// An out-fence pointer property; the device fills in the pointer at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceRequest {
    pub object_id: u32,
    pub property_id: u32,
    pub slot: FenceSlot,
}

#[derive(Debug, Default)]
pub struct CommitFences {
    pub retire: Option<OwnedFd>,
    pub writeback: Option<OwnedFd>,
}

pub trait KmsDevice: Send + Sync {
    fn resources(&self) -> io::Result<KmsResources>;

    fn properties(&self, object_id: u32, ty: ObjectType) -> io::Result<Vec<PropertyDesc>>;

    fn property_blob(&self, blob_id: u64) -> io::Result<Vec<u8>>;

    fn create_blob(&self, data: &[u8]) -> io::Result<u32>;

    fn destroy_blob(&self, blob_id: u32) -> io::Result<()>;

    /// `PRIME_FD_TO_HANDLE`: imports a dma-buf into a GEM handle.
    fn import_prime_fd(&self, fd: BorrowedFd<'_>) -> io::Result<u32>;

    /// `GEM_CLOSE`.
    fn close_gem_handle(&self, handle: u32) -> io::Result<()>;

    /// `AddFB2WithModifiers`.
    fn add_framebuffer(&self, spec: &FramebufferSpec) -> io::Result<u32>;

    /// `RmFB`. May block until the hardware stopped scanning out of the framebuffer.
    fn remove_framebuffer(&self, fb_id: u32) -> io::Result<()>;

    fn atomic_commit(
        &self,
        items: &[AtomicItem],
        fences: &[FenceRequest],
        flags: AtomicFlags,
    ) -> io::Result<CommitFences>;

    /// Legacy (non-atomic) connector property write, used for DPMS.
    fn set_connector_property(&self, connector_id: u32, property_id: u32, value: u64)
        -> io::Result<()>;

    /// Blocks until the next vblank on `pipe` and returns its CLOCK_MONOTONIC timestamp.
    fn wait_vblank(&self, pipe: u32) -> io::Result<Duration>;
}
