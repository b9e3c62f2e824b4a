//! A recording [`KmsDevice`] for tests.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::device::{
    AtomicFlags, AtomicItem, CommitFences, ConnectorDesc, CrtcDesc, FenceRequest, FenceSlot,
    FramebufferSpec, KmsDevice, KmsResources, ObjectType, PlaneDesc, PropertyDesc, PropertyKind,
};
use super::mode::test_mode_info;
use crate::brightness::table::{BrightnessAttribute, BrightnessCapability};
use crate::utils::get_monotonic_time;

pub const CRTC: u32 = 31;
pub const OTHER_CRTC: u32 = 32;
pub const CONNECTOR: u32 = 41;
pub const WRITEBACK_CONNECTOR: u32 = 42;
pub const PLANES: [u32; 4] = [50, 51, 52, 53];

#[derive(Debug, Clone)]
pub struct RecordedCommit {
    pub items: Vec<AtomicItem>,
    pub fences: Vec<FenceRequest>,
    pub flags: AtomicFlags,
}

#[derive(Default)]
struct State {
    resources: KmsResources,
    properties: HashMap<u32, Vec<PropertyDesc>>,
    blobs: HashMap<u32, Vec<u8>>,
    next_id: u32,
    imports: usize,
    closed_handles: Vec<u32>,
    framebuffers: Vec<(u32, FramebufferSpec)>,
    removed_framebuffers: Vec<u32>,
    destroyed_blobs: Vec<u32>,
    commits: Vec<RecordedCommit>,
    legacy_writes: Vec<(u32, u32, u64)>,
    fail_commit: Option<i32>,
    fail_add_framebuffer: Option<i32>,
    vblank_period: Duration,
}

pub struct FakeKms {
    state: Mutex<State>,
    changed: Condvar,
}

impl FakeKms {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1000,
                vblank_period: Duration::from_millis(1),
                ..Default::default()
            }),
            changed: Condvar::new(),
        }
    }

    /// One panel on [`CONNECTOR`] driven by [`CRTC`], a writeback connector and four planes.
    ///
    /// The last plane can also be used by [`OTHER_CRTC`].
    pub fn with_display() -> Self {
        let kms = Self::new();
        {
            let mut state = kms.lock();
            state.resources = KmsResources {
                crtcs: vec![
                    CrtcDesc { id: CRTC, pipe: 0 },
                    CrtcDesc {
                        id: OTHER_CRTC,
                        pipe: 1,
                    },
                ],
                connectors: vec![
                    ConnectorDesc {
                        id: CONNECTOR,
                        writeback: false,
                        connected: true,
                        modes: vec![
                            test_mode_info(1080, 2400, 60),
                            test_mode_info(1080, 2400, 120),
                            test_mode_info(1440, 3120, 60),
                        ],
                    },
                    ConnectorDesc {
                        id: WRITEBACK_CONNECTOR,
                        writeback: true,
                        connected: true,
                        modes: Vec::new(),
                    },
                ],
                planes: PLANES
                    .iter()
                    .enumerate()
                    .map(|(i, &id)| PlaneDesc {
                        id,
                        possible_crtcs: if i == PLANES.len() - 1 { 0b11 } else { 0b01 },
                    })
                    .collect(),
            };

            let capability = bytemuck::bytes_of(&test_brightness_capability()).to_vec();
            let capability_blob = state.alloc_id();
            state.blobs.insert(capability_blob, capability);

            let crtc = state.props(&[
                ("ACTIVE", range(0, 1)),
                ("MODE_ID", PropertyKind::Blob),
                ("OUT_FENCE_PTR", range(0, u64::MAX)),
                ("partial_region", PropertyKind::Blob),
            ]);
            state.properties.insert(CRTC, crtc.clone());
            state.properties.insert(OTHER_CRTC, crtc);

            let mut connector = state.props(&[
                ("CRTC_ID", PropertyKind::Object),
                ("DPMS", enumeration(&[("On", 0), ("Off", 3)])),
                ("brightness_capability", PropertyKind::Blob),
                ("brightness_level", range(0, 4095)),
                (
                    "hbm_mode",
                    enumeration(&[("Off", 0), ("On IRC On", 1), ("On IRC Off", 2)]),
                ),
                ("dimming_on", range(0, 1)),
                ("lhbm_on", range(0, 1)),
                (
                    "mipi_sync",
                    PropertyKind::Bitmask(named(&[
                        ("sync_refresh_rate", 0),
                        ("sync_lhbm", 1),
                        ("sync_ghbm", 2),
                        ("sync_bl", 3),
                    ])),
                ),
            ]);
            if let Some(cap) = connector
                .iter_mut()
                .find(|p| p.name == "brightness_capability")
            {
                cap.value = u64::from(capability_blob);
                cap.immutable = true;
            }
            state.properties.insert(CONNECTOR, connector);

            let writeback = state.props(&[
                ("CRTC_ID", PropertyKind::Object),
                ("WRITEBACK_FB_ID", PropertyKind::Object),
                ("WRITEBACK_OUT_FENCE_PTR", range(0, u64::MAX)),
            ]);
            state.properties.insert(WRITEBACK_CONNECTOR, writeback);

            for (i, plane) in PLANES.iter().enumerate() {
                let props = state.props(&[
                    ("FB_ID", PropertyKind::Object),
                    ("CRTC_ID", PropertyKind::Object),
                    ("CRTC_X", signed()),
                    ("CRTC_Y", signed()),
                    ("CRTC_W", range(0, u64::from(u32::MAX))),
                    ("CRTC_H", range(0, u64::from(u32::MAX))),
                    ("SRC_X", range(0, u64::from(u32::MAX))),
                    ("SRC_Y", range(0, u64::from(u32::MAX))),
                    ("SRC_W", range(0, u64::from(u32::MAX))),
                    ("SRC_H", range(0, u64::from(u32::MAX))),
                    (
                        "rotation",
                        PropertyKind::Bitmask(named(&[
                            ("rotate-0", 0),
                            ("rotate-90", 1),
                            ("rotate-180", 2),
                            ("rotate-270", 3),
                            ("reflect-x", 4),
                            ("reflect-y", 5),
                        ])),
                    ),
                    (
                        "pixel blend mode",
                        enumeration(&[("None", 2), ("Pre-multiplied", 0), ("Coverage", 1)]),
                    ),
                    ("zpos", range(i as u64, 7)),
                    ("alpha", range(0, 0xffff)),
                    ("IN_FENCE_FD", signed()),
                    ("colormap", range(0, u64::from(u32::MAX))),
                    (
                        "standard",
                        enumeration(&[("Unspecified", 0), ("BT709", 1), ("BT2020", 6)]),
                    ),
                    (
                        "transfer",
                        enumeration(&[
                            ("Unspecified", 0),
                            ("sRGB", 2),
                            ("ST2084", 7),
                            ("HLG", 8),
                        ]),
                    ),
                    (
                        "range",
                        enumeration(&[("Unspecified", 0), ("Full", 1), ("Limited", 2)]),
                    ),
                    ("min_luminance", range(0, u64::from(u32::MAX))),
                    ("max_luminance", range(0, u64::from(u32::MAX))),
                ]);
                state.properties.insert(*plane, props);
            }
        }
        kms
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn fail_next_commit(&self, errno: i32) {
        self.lock().fail_commit = Some(errno);
    }

    pub fn fail_next_add_framebuffer(&self, errno: i32) {
        self.lock().fail_add_framebuffer = Some(errno);
    }

    pub fn set_vblank_period(&self, period: Duration) {
        self.lock().vblank_period = period;
    }

    /// Id of the property `name` on `object_id`.
    pub fn prop_id(&self, object_id: u32, name: &str) -> u32 {
        self.lock().properties[&object_id]
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.id)
            .unwrap_or_else(|| panic!("object {object_id} has no {name}"))
    }

    pub fn import_count(&self) -> usize {
        self.lock().imports
    }

    pub fn closed_handles(&self) -> Vec<u32> {
        self.lock().closed_handles.clone()
    }

    pub fn added_framebuffers(&self) -> Vec<u32> {
        self.lock().framebuffers.iter().map(|(id, _)| *id).collect()
    }

    pub fn framebuffer_spec(&self, fb_id: u32) -> Option<FramebufferSpec> {
        self.lock()
            .framebuffers
            .iter()
            .find_map(|(id, spec)| (*id == fb_id).then_some(*spec))
    }

    pub fn removed_framebuffers(&self) -> Vec<u32> {
        self.lock().removed_framebuffers.clone()
    }

    /// Waits until at least `count` framebuffers have been removed.
    pub fn wait_removed_framebuffers(&self, count: usize) -> Vec<u32> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut state = self.lock();
        while state.removed_framebuffers.len() < count {
            let now = Instant::now();
            assert!(now < deadline, "timed out waiting for {count} RmFB calls");
            state = self.changed.wait_timeout(state, deadline - now).unwrap().0;
        }
        state.removed_framebuffers.clone()
    }

    pub fn blob(&self, blob_id: u32) -> Option<Vec<u8>> {
        self.lock().blobs.get(&blob_id).cloned()
    }

    pub fn live_blobs(&self) -> usize {
        self.lock().blobs.len()
    }

    pub fn destroyed_blobs(&self) -> Vec<u32> {
        self.lock().destroyed_blobs.clone()
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.lock().commits.clone()
    }

    pub fn last_commit(&self) -> RecordedCommit {
        self.lock().commits.last().cloned().expect("no commits")
    }

    pub fn legacy_writes(&self) -> Vec<(u32, u32, u64)> {
        self.lock().legacy_writes.clone()
    }

    /// Value written to `name` on `object_id` in `commit`, if any.
    pub fn committed_value(&self, commit: &RecordedCommit, object_id: u32, name: &str) -> Option<u64> {
        let prop = self.prop_id(object_id, name);
        commit
            .items
            .iter()
            .rev()
            .find(|item| item.object_id == object_id && item.property_id == prop)
            .map(|item| item.value)
    }
}

impl State {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn props(&mut self, list: &[(&str, PropertyKind)]) -> Vec<PropertyDesc> {
        list.iter()
            .map(|(name, kind)| PropertyDesc {
                id: self.alloc_id(),
                name: name.to_string(),
                value: 0,
                kind: kind.clone(),
                immutable: false,
            })
            .collect()
    }
}

fn range(min: u64, max: u64) -> PropertyKind {
    PropertyKind::Range { min, max }
}

fn signed() -> PropertyKind {
    PropertyKind::SignedRange {
        min: i64::from(i32::MIN),
        max: i64::from(i32::MAX),
    }
}

fn named(entries: &[(&str, u64)]) -> Vec<(String, u64)> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

fn enumeration(entries: &[(&str, u64)]) -> PropertyKind {
    PropertyKind::Enum(named(entries))
}

/// Normal range covers 0.0..=0.6 at 2..=500 nits, HBM covers 0.6..=1.0 at 500..=1000 nits.
pub fn test_brightness_capability() -> BrightnessCapability {
    BrightnessCapability {
        normal: BrightnessAttribute {
            nits_min: 2,
            nits_max: 500,
            level_min: 1,
            level_max: 2047,
            percentage_min: 0,
            percentage_max: 60,
        },
        hbm: BrightnessAttribute {
            nits_min: 500,
            nits_max: 1000,
            level_min: 2048,
            level_max: 4095,
            percentage_min: 60,
            percentage_max: 100,
        },
    }
}

fn null_fd() -> io::Result<OwnedFd> {
    Ok(OwnedFd::from(File::open("/dev/null")?))
}

/// An fd usable as a dma-buf or fence stand-in.
pub fn dummy_fd() -> OwnedFd {
    null_fd().unwrap()
}

impl KmsDevice for FakeKms {
    fn resources(&self) -> io::Result<KmsResources> {
        Ok(self.lock().resources.clone())
    }

    fn properties(&self, object_id: u32, _ty: ObjectType) -> io::Result<Vec<PropertyDesc>> {
        self.lock()
            .properties
            .get(&object_id)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn property_blob(&self, blob_id: u64) -> io::Result<Vec<u8>> {
        self.lock()
            .blobs
            .get(&(blob_id as u32))
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        let mut state = self.lock();
        let id = state.alloc_id();
        state.blobs.insert(id, data.to_vec());
        Ok(id)
    }

    fn destroy_blob(&self, blob_id: u32) -> io::Result<()> {
        let mut state = self.lock();
        state.destroyed_blobs.push(blob_id);
        state
            .blobs
            .remove(&blob_id)
            .map(|_| ())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn import_prime_fd(&self, _fd: BorrowedFd<'_>) -> io::Result<u32> {
        let mut state = self.lock();
        state.imports += 1;
        Ok(state.alloc_id())
    }

    fn close_gem_handle(&self, handle: u32) -> io::Result<()> {
        self.lock().closed_handles.push(handle);
        Ok(())
    }

    fn add_framebuffer(&self, spec: &FramebufferSpec) -> io::Result<u32> {
        let mut state = self.lock();
        if let Some(errno) = state.fail_add_framebuffer.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let id = state.alloc_id();
        state.framebuffers.push((id, *spec));
        Ok(id)
    }

    fn remove_framebuffer(&self, fb_id: u32) -> io::Result<()> {
        self.lock().removed_framebuffers.push(fb_id);
        self.changed.notify_all();
        Ok(())
    }

    fn atomic_commit(
        &self,
        items: &[AtomicItem],
        fences: &[FenceRequest],
        flags: AtomicFlags,
    ) -> io::Result<CommitFences> {
        let mut state = self.lock();
        if let Some(errno) = state.fail_commit.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }

        state.commits.push(RecordedCommit {
            items: items.to_vec(),
            fences: fences.to_vec(),
            flags,
        });

        let mut out = CommitFences::default();
        if flags.contains(AtomicFlags::TEST_ONLY) {
            return Ok(out);
        }
        for fence in fences {
            match fence.slot {
                FenceSlot::Retire => out.retire = Some(null_fd()?),
                FenceSlot::Writeback => out.writeback = Some(null_fd()?),
            }
        }
        Ok(out)
    }

    fn set_connector_property(
        &self,
        connector_id: u32,
        property_id: u32,
        value: u64,
    ) -> io::Result<()> {
        self.lock()
            .legacy_writes
            .push((connector_id, property_id, value));
        Ok(())
    }

    fn wait_vblank(&self, _pipe: u32) -> io::Result<Duration> {
        let period = self.lock().vblank_period;
        std::thread::sleep(period);
        Ok(get_monotonic_time())
    }
}
