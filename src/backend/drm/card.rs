//! [`KmsDevice`] on a real `/dev/dri/cardN` node.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use drm::control::{self, connector, crtc, plane, property, Device as ControlDevice};
use drm::{ClientCapability, Device};
use tracing::{debug, warn};

use super::device::{
    AtomicFlags, AtomicItem, CommitFences, ConnectorDesc, CrtcDesc, FenceRequest, FenceSlot,
    FramebufferSpec, KmsDevice, KmsResources, ObjectType, PlaneDesc, PropertyDesc, PropertyKind,
};
use super::mode::ModeInfo;

const DRM_VBLANK_RELATIVE: u32 = 0x1;
const DRM_VBLANK_SECONDARY: u32 = 0x2000_0000;
const DRM_VBLANK_HIGH_CRTC_SHIFT: u32 = 1;
const DRM_VBLANK_HIGH_CRTC_MASK: u32 = 0x0000_003e;

pub struct DrmCard {
    file: File,
    path: PathBuf,
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Device for DrmCard {}
impl ControlDevice for DrmCard {}

impl DrmCard {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("error opening {path:?}"))?;
        let card = Self {
            file,
            path: path.to_owned(),
        };

        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .context("error enabling universal planes")?;
        card.set_client_capability(ClientCapability::Atomic, true)
            .context("error enabling atomic modesetting")?;
        if let Err(err) = card.set_client_capability(ClientCapability::WritebackConnectors, true) {
            warn!("writeback connectors unavailable on {path:?}: {err}");
        }

        debug!("opened {path:?}");
        Ok(card)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn property_desc(&self, handle: property::Handle, value: u64) -> io::Result<PropertyDesc> {
        let info = self.get_property(handle)?;
        let name = info.name().to_string_lossy().into_owned();

        let kind = match info.value_type() {
            property::ValueType::Boolean => PropertyKind::Range { min: 0, max: 1 },
            property::ValueType::UnsignedRange(min, max) => PropertyKind::Range { min, max },
            property::ValueType::SignedRange(min, max) => PropertyKind::SignedRange { min, max },
            property::ValueType::Enum(values) => {
                let (_, entries) = values.values();
                PropertyKind::Enum(
                    entries
                        .iter()
                        .map(|entry| (entry.name().to_string_lossy().into_owned(), entry.value()))
                        .collect(),
                )
            }
            property::ValueType::Bitmask => PropertyKind::Bitmask(self.bitmask_entries(handle)?),
            property::ValueType::Blob => PropertyKind::Blob,
            property::ValueType::Object
            | property::ValueType::CRTC
            | property::ValueType::Connector
            | property::ValueType::Encoder
            | property::ValueType::Framebuffer
            | property::ValueType::Plane
            | property::ValueType::Property => PropertyKind::Object,
            _ => PropertyKind::Other,
        };

        Ok(PropertyDesc {
            id: u32::from(handle),
            name,
            value,
            kind,
            immutable: !info.mutable(),
        })
    }

    /// The high-level property info does not carry bitmask entry names.
    fn bitmask_entries(&self, handle: property::Handle) -> io::Result<Vec<(String, u64)>> {
        let mut values = Vec::new();
        let mut enums = Vec::new();
        drm_ffi::mode::get_property(
            self.as_fd(),
            u32::from(handle),
            Some(&mut values),
            Some(&mut enums),
        )?;

        Ok(enums
            .iter()
            .map(|entry| {
                let bytes: Vec<u8> = entry
                    .name
                    .iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| c as u8)
                    .collect();
                (String::from_utf8_lossy(&bytes).into_owned(), entry.value)
            })
            .collect())
    }
}

fn not_found() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

fn handle<H: control::ResourceHandle>(id: u32) -> io::Result<H> {
    control::from_u32(id).ok_or_else(not_found)
}

fn mode_info(mode: &control::Mode) -> ModeInfo {
    let raw = drm_ffi::drm_mode_modeinfo::from(*mode);
    let mut name = [0u8; 32];
    for (dst, src) in name.iter_mut().zip(raw.name.iter()) {
        *dst = *src as u8;
    }

    ModeInfo {
        clock: raw.clock,
        hdisplay: raw.hdisplay,
        hsync_start: raw.hsync_start,
        hsync_end: raw.hsync_end,
        htotal: raw.htotal,
        hskew: raw.hskew,
        vdisplay: raw.vdisplay,
        vsync_start: raw.vsync_start,
        vsync_end: raw.vsync_end,
        vtotal: raw.vtotal,
        vscan: raw.vscan,
        vrefresh: raw.vrefresh,
        flags: raw.flags,
        type_: raw.type_,
        name,
    }
}

impl KmsDevice for DrmCard {
    fn resources(&self) -> io::Result<KmsResources> {
        let res = self.resource_handles()?;

        let crtcs: Vec<CrtcDesc> = res
            .crtcs()
            .iter()
            .enumerate()
            .map(|(pipe, crtc)| CrtcDesc {
                id: u32::from(*crtc),
                pipe: pipe as u32,
            })
            .collect();

        let mut connectors = Vec::new();
        for conn in res.connectors() {
            let info = self.get_connector(*conn, false)?;
            connectors.push(ConnectorDesc {
                id: u32::from(*conn),
                writeback: info.interface() == connector::Interface::Writeback,
                connected: info.state() == connector::State::Connected,
                modes: info.modes().iter().map(mode_info).collect(),
            });
        }

        let mut planes = Vec::new();
        for plane in self.plane_handles()? {
            let info = self.get_plane(plane)?;
            let possible = res.filter_crtcs(info.possible_crtcs());
            let possible_crtcs = res
                .crtcs()
                .iter()
                .enumerate()
                .filter(|(_, crtc)| possible.contains(crtc))
                .fold(0u32, |mask, (pipe, _)| mask | (1 << pipe));

            planes.push(PlaneDesc {
                id: u32::from(plane),
                possible_crtcs,
            });
        }

        Ok(KmsResources {
            crtcs,
            connectors,
            planes,
        })
    }

    fn properties(&self, object_id: u32, ty: ObjectType) -> io::Result<Vec<PropertyDesc>> {
        let set = match ty {
            ObjectType::Crtc => self.get_properties(handle::<crtc::Handle>(object_id)?)?,
            ObjectType::Connector => {
                self.get_properties(handle::<connector::Handle>(object_id)?)?
            }
            ObjectType::Plane => self.get_properties(handle::<plane::Handle>(object_id)?)?,
        };

        let (handles, values) = set.as_props_and_values();
        handles
            .iter()
            .zip(values)
            .map(|(handle, value)| self.property_desc(*handle, *value))
            .collect()
    }

    fn property_blob(&self, blob_id: u64) -> io::Result<Vec<u8>> {
        self.get_property_blob(blob_id)
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        let mut data = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.as_fd(), &mut data)?;
        Ok(blob.blob_id)
    }

    fn destroy_blob(&self, blob_id: u32) -> io::Result<()> {
        self.destroy_property_blob(u64::from(blob_id))
    }

    fn import_prime_fd(&self, fd: BorrowedFd<'_>) -> io::Result<u32> {
        let handle = self.prime_fd_to_buffer(fd)?;
        Ok(u32::from(handle))
    }

    fn close_gem_handle(&self, handle: u32) -> io::Result<()> {
        drm_ffi::gem::close(self.as_fd(), handle)?;
        Ok(())
    }

    fn add_framebuffer(&self, spec: &FramebufferSpec) -> io::Result<u32> {
        let fb = drm_ffi::mode::add_fb2(
            self.as_fd(),
            spec.width,
            spec.height,
            spec.format,
            &spec.handles,
            &spec.pitches,
            &spec.offsets,
            &spec.modifiers,
            spec.flags,
        )?;
        Ok(fb.fb_id)
    }

    fn remove_framebuffer(&self, fb_id: u32) -> io::Result<()> {
        drm_ffi::mode::rm_fb(self.as_fd(), fb_id)
    }

    fn atomic_commit(
        &self,
        items: &[AtomicItem],
        fences: &[FenceRequest],
        flags: AtomicFlags,
    ) -> io::Result<CommitFences> {
        let _span = tracy_client::span!("DrmCard::atomic_commit");

        // The kernel writes the out-fence fds through these pointers.
        let mut retire_fd: i32 = -1;
        let mut writeback_fd: i32 = -1;

        let mut all: Vec<AtomicItem> = items.to_vec();
        for fence in fences {
            let ptr = match fence.slot {
                FenceSlot::Retire => &mut retire_fd as *mut i32,
                FenceSlot::Writeback => &mut writeback_fd as *mut i32,
            };
            all.push(AtomicItem {
                object_id: fence.object_id,
                property_id: fence.property_id,
                value: ptr as u64,
            });
        }
        // Stable, so later writes to the same property still win.
        all.sort_by_key(|item| item.object_id);

        let mut objects = Vec::new();
        let mut counts: Vec<u32> = Vec::new();
        let mut props = Vec::with_capacity(all.len());
        let mut values = Vec::with_capacity(all.len());
        for item in &all {
            if objects.last() != Some(&item.object_id) {
                objects.push(item.object_id);
                counts.push(0);
            }
            if let Some(count) = counts.last_mut() {
                *count += 1;
            }
            props.push(item.property_id);
            values.push(item.value);
        }

        drm_ffi::mode::atomic_commit(
            self.as_fd(),
            flags.bits(),
            &mut objects,
            &mut counts,
            &mut props,
            &mut values,
        )?;

        // SAFETY: on success the kernel installed these fds for us; nothing else owns them.
        let own = |fd: i32| (fd >= 0).then(|| unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(CommitFences {
            retire: own(retire_fd),
            writeback: own(writeback_fd),
        })
    }

    fn set_connector_property(
        &self,
        connector_id: u32,
        property_id: u32,
        value: u64,
    ) -> io::Result<()> {
        self.set_property(
            handle::<connector::Handle>(connector_id)?,
            handle::<property::Handle>(property_id)?,
            value,
        )
    }

    fn wait_vblank(&self, pipe: u32) -> io::Result<Duration> {
        let mut ty = DRM_VBLANK_RELATIVE;
        if pipe == 1 {
            ty |= DRM_VBLANK_SECONDARY;
        } else if pipe > 1 {
            ty |= (pipe << DRM_VBLANK_HIGH_CRTC_SHIFT) & DRM_VBLANK_HIGH_CRTC_MASK;
        }

        let reply = drm_ffi::wait_vblank(self.as_fd(), ty, 1, 0)?;
        Ok(Duration::new(
            reply.tval_sec as u64,
            (reply.tval_usec as u32).saturating_mul(1000),
        ))
    }
}
