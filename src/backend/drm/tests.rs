use std::fs;
use std::os::fd::AsRawFd;
use std::sync::atomic::AtomicUsize;
use std::thread;
use std::time::Instant;

use hwc_config::Config;
use tempfile::TempDir;

use super::format::{Compression, HAL_PIXEL_FORMAT_RGBA_8888};
use super::mode::ModeInfo;
use super::props::HbmMode;
use super::testing::{
    dummy_fd, FakeKms, RecordedCommit, CONNECTOR, CRTC, PLANES, WRITEBACK_CONNECTOR,
};
use super::types::{BufferInfo, FbOwner, LayerId};
use super::*;

#[derive(Default)]
struct Listener {
    vsyncs: AtomicUsize,
    applied: Mutex<Vec<u32>>,
}

impl DisplayEventListener for Listener {
    fn on_vsync(&self, _display_id: u32, _timestamp: Duration, _vsync_period_ns: u64) {
        self.vsyncs.fetch_add(1, Ordering::SeqCst);
    }

    fn on_config_applied(&self, _display_id: u32, config_id: u32, _timestamp: Duration) {
        self.applied.lock().unwrap().push(config_id);
    }

    fn on_refresh_requested(&self, _display_id: u32) {}
}

impl Listener {
    fn vsyncs(&self) -> usize {
        self.vsyncs.load(Ordering::SeqCst)
    }

    fn applied(&self) -> Vec<u32> {
        self.applied.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct Histogram {
    done: Mutex<Vec<bool>>,
}

impl HistogramCapable for Histogram {
    fn prepare_histogram_commit(&self, _crtc_id: u32, _req: &mut AtomicReq<'_>) -> Result<()> {
        Ok(())
    }

    fn on_commit_done(&self, success: bool) {
        self.done.lock().unwrap().push(success);
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

struct Fixture {
    _dir: TempDir,
    kms: Arc<FakeKms>,
    ctx: Arc<HwcContext>,
    listener: Arc<Listener>,
    reservations: Arc<PlaneReservations>,
    display: DisplayDrmInterface,
}

impl Fixture {
    fn new() -> Self {
        Self::with_histogram(None)
    }

    fn with_histogram(histogram: Option<Arc<dyn HistogramCapable>>) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.panel.backlight_root = dir.path().to_owned();
        config.panel.sysfs_check_timeout_ms = 20;
        config.debug.drm_debug_node = dir.path().join("debug");
        fs::write(&config.debug.drm_debug_node, "0").unwrap();

        let backlight = config.panel.backlight_dir();
        fs::create_dir_all(&backlight).unwrap();
        for (node, value) in [
            ("brightness", "0"),
            ("max_brightness", "4095"),
            ("hbm_mode", "0"),
            ("local_hbm_mode", "0"),
        ] {
            fs::write(backlight.join(node), value).unwrap();
        }

        let kms = Arc::new(FakeKms::with_display());
        let ctx = HwcContext::new(config);
        let listener = Arc::new(Listener::default());
        let reservations = PlaneReservations::new();

        let target = DisplayTarget::primary(&kms.resources().unwrap()).unwrap();
        let collaborators = DisplayCollaborators {
            listener: Some(listener.clone() as Arc<dyn DisplayEventListener>),
            color: None,
            histogram,
        };
        let display = DisplayDrmInterface::new(
            kms.clone(),
            ctx.clone(),
            target,
            reservations.clone(),
            collaborators,
        )
        .unwrap();

        Self {
            _dir: dir,
            kms,
            ctx,
            listener,
            reservations,
            display,
        }
    }

    fn value(&self, commit: &RecordedCommit, object_id: u32, name: &str) -> Option<u64> {
        self.kms.committed_value(commit, object_id, name)
    }
}

fn buffer(id: u64) -> BufferInfo {
    BufferInfo {
        id,
        fds: vec![Arc::new(dummy_fd())],
        width: 1080,
        height: 2400,
        stride: 1088,
        format: HAL_PIXEL_FORMAT_RGBA_8888,
        compression: Compression::None,
        protected: false,
    }
}

fn layer(layer: u64, plane: usize, buffer: BufferInfo) -> WinConfig {
    let mut config = WinConfig::new(
        FbOwner::Layer(LayerId(layer)),
        plane,
        WinConfigState::Buffer(buffer),
    );
    config.src = Rect::new(0, 0, 1080, 2400);
    config.dst = Rect::new(0, 0, 1080, 2400);
    config
}

fn frame(configs: Vec<WinConfig>) -> Frame {
    Frame {
        configs,
        ..Frame::default()
    }
}

fn simple_frame() -> Frame {
    frame(vec![layer(1, 0, buffer(10))])
}

#[test]
fn primary_target() {
    let kms = FakeKms::with_display();
    let target = DisplayTarget::primary(&kms.resources().unwrap()).unwrap();
    assert_eq!(
        target,
        DisplayTarget {
            display_id: 0,
            crtc_id: CRTC,
            connector_id: CONNECTOR,
        }
    );
}

#[test]
fn init_resolves_display() {
    let f = Fixture::new();
    assert_eq!(f.display.plane_count(), PLANES.len());
    assert_eq!(f.display.display_modes().len(), 3);
    assert_eq!(f.display.active_config(), None);
    assert!(f.display.brightness().caps().ghbm);
    assert!(f.display.brightness().table().is_some());
}

#[test]
fn first_frame_sets_mode() {
    let mut f = Fixture::new();
    f.display.set_active_config(1, false).unwrap();

    let mut color = WinConfig::new(
        FbOwner::Layer(LayerId(2)),
        1,
        WinConfigState::Color(0xff00_00ff),
    );
    color.dst = Rect::new(0, 0, 1080, 100);
    let fences = f
        .display
        .deliver_win_config_data(&frame(vec![layer(1, 0, buffer(10)), color]))
        .unwrap();

    let commit = f.kms.last_commit();
    assert_eq!(
        commit.flags,
        AtomicFlags::NONBLOCK | AtomicFlags::ALLOW_MODESET
    );
    assert_eq!(f.value(&commit, CRTC, "ACTIVE"), Some(1));
    assert_eq!(
        f.value(&commit, CONNECTOR, "CRTC_ID"),
        Some(u64::from(CRTC))
    );

    let blob = f.value(&commit, CRTC, "MODE_ID").unwrap();
    let info: ModeInfo = bytemuck::pod_read_unaligned(&f.kms.blob(blob as u32).unwrap());
    assert_eq!(info.name(), "1080x2400");
    assert_eq!(info.vrefresh, 60);

    assert!(commit
        .fences
        .iter()
        .any(|fence| fence.slot == FenceSlot::Retire && fence.object_id == CRTC));
    assert!(fences.retire.is_some());
    // Only buffer-backed layers get a release fence.
    assert!(fences.release[0].is_some());
    assert!(fences.release[1].is_none());
    assert_eq!(
        f.value(&commit, PLANES[1], "colormap"),
        Some(0xff00_00ff)
    );

    assert_eq!(f.display.active_config(), Some(1));
}

#[test]
fn repeated_frame_reuses_framebuffers() {
    let mut f = Fixture::new();
    f.display.set_active_config(1, false).unwrap();
    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    let fb = f.value(&f.kms.last_commit(), PLANES[0], "FB_ID").unwrap();

    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    let commit = f.kms.last_commit();
    assert_eq!(commit.flags, AtomicFlags::NONBLOCK);
    assert_eq!(f.value(&commit, CRTC, "MODE_ID"), None);
    assert_eq!(f.value(&commit, PLANES[0], "FB_ID"), Some(fb));
    assert_eq!(f.kms.added_framebuffers().len(), 1);
}

#[test]
fn refresh_rate_switch_is_seamless() {
    let mut f = Fixture::new();
    f.display.set_active_config(1, false).unwrap();
    f.display.deliver_win_config_data(&simple_frame()).unwrap();

    f.display.set_active_config(2, false).unwrap();
    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    let commit = f.kms.last_commit();
    assert_eq!(commit.flags, AtomicFlags::NONBLOCK);
    assert!(f.value(&commit, CRTC, "MODE_ID").is_some());
    let mipi_sync = f.value(&commit, CONNECTOR, "mipi_sync").unwrap();
    assert_eq!(mipi_sync & 1, 1);

    f.display.set_active_config(3, false).unwrap();
    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    assert!(f
        .kms
        .last_commit()
        .flags
        .contains(AtomicFlags::ALLOW_MODESET));
    assert_eq!(f.display.active_config(), Some(3));
}

#[test]
fn replaced_mode_blob_outlives_one_mode_set() {
    let mut f = Fixture::new();
    let mut blobs = Vec::new();
    for config in [1, 2, 1] {
        f.display.set_active_config(config, false).unwrap();
        f.display.deliver_win_config_data(&simple_frame()).unwrap();
        let blob = f.value(&f.kms.last_commit(), CRTC, "MODE_ID").unwrap();
        blobs.push(blob as u32);

        if blobs.len() == 2 {
            assert!(!f.kms.destroyed_blobs().contains(&blobs[0]));
        }
    }

    let destroyed = f.kms.destroyed_blobs();
    assert!(destroyed.contains(&blobs[0]));
    assert!(!destroyed.contains(&blobs[1]));
    assert!(!destroyed.contains(&blobs[2]));
}

#[test]
fn test_only_config_changes_nothing() {
    let mut f = Fixture::new();
    f.display.set_active_config(2, true).unwrap();

    let commit = f.kms.last_commit();
    assert!(commit.flags.contains(AtomicFlags::TEST_ONLY));
    let blob = f.value(&commit, CRTC, "MODE_ID").unwrap();
    assert!(f.kms.destroyed_blobs().contains(&(blob as u32)));

    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    assert_eq!(f.value(&f.kms.last_commit(), CRTC, "MODE_ID"), None);
    assert_eq!(f.display.active_config(), None);
}

#[test]
fn unknown_config() {
    let mut f = Fixture::new();
    let blobs = f.kms.live_blobs();
    let err = f.display.set_active_config(9, false).unwrap_err();
    assert!(matches!(err, HwcError::BadConfig(9)));
    assert_eq!(f.kms.live_blobs(), blobs);
}

#[test]
fn unused_planes_are_disabled_except_reserved() {
    let mut f = Fixture::new();
    f.reservations.reserve(PLANES[3], 1);

    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    let commit = f.kms.last_commit();
    assert_ne!(f.value(&commit, PLANES[0], "FB_ID"), Some(0));
    for plane in &PLANES[1..3] {
        assert_eq!(f.value(&commit, *plane, "FB_ID"), Some(0));
        assert_eq!(f.value(&commit, *plane, "CRTC_ID"), Some(0));
    }
    assert_eq!(f.value(&commit, PLANES[3], "FB_ID"), None);

    let err = f
        .display
        .deliver_win_config_data(&frame(vec![layer(1, 3, buffer(10))]))
        .unwrap_err();
    assert!(matches!(err, HwcError::BadValue(_)));
}

#[test]
fn plane_properties() {
    let mut f = Fixture::new();

    let fence = Arc::new(dummy_fd());
    let mut sdr = layer(1, 1, buffer(10));
    sdr.src = Rect::new(10, 20, 500, 600);
    sdr.dst = Rect::new(-5, 30, 500, 600);
    sdr.plane_alpha = 0.5;
    sdr.acquire_fence = Some(fence.clone());

    let mut hdr = layer(2, 2, buffer(11));
    // BT2020, ST2084, full range.
    hdr.dataspace = (6 << 16) | TRANSFER_ST2084 | (1 << 27);
    hdr.min_luminance = 5;
    hdr.max_luminance = 1000;

    f.display
        .deliver_win_config_data(&frame(vec![sdr, hdr]))
        .unwrap();
    let commit = f.kms.last_commit();
    let plane = PLANES[1];

    assert_eq!(f.value(&commit, plane, "CRTC_ID"), Some(u64::from(CRTC)));
    assert_eq!(f.value(&commit, plane, "SRC_X"), Some(10 << 16));
    assert_eq!(f.value(&commit, plane, "SRC_Y"), Some(20 << 16));
    assert_eq!(f.value(&commit, plane, "SRC_W"), Some(500 << 16));
    assert_eq!(f.value(&commit, plane, "CRTC_X"), Some(-5i64 as u64));
    assert_eq!(f.value(&commit, plane, "CRTC_H"), Some(600));
    assert_eq!(f.value(&commit, plane, "rotation"), Some(1));
    // Config index plus the plane's zpos minimum.
    assert_eq!(f.value(&commit, plane, "zpos"), Some(1));
    assert_eq!(f.value(&commit, plane, "alpha"), Some(0x8000));
    assert_eq!(f.value(&commit, plane, "pixel blend mode"), Some(0));
    assert_eq!(
        f.value(&commit, plane, "IN_FENCE_FD"),
        Some(fence.as_raw_fd() as u64)
    );
    assert_eq!(f.value(&commit, plane, "transfer"), Some(0));
    assert_eq!(f.value(&commit, plane, "min_luminance"), None);

    let plane = PLANES[2];
    assert_eq!(f.value(&commit, plane, "zpos"), Some(3));
    assert_eq!(f.value(&commit, plane, "standard"), Some(6));
    assert_eq!(f.value(&commit, plane, "transfer"), Some(7));
    assert_eq!(f.value(&commit, plane, "range"), Some(1));
    assert_eq!(f.value(&commit, plane, "min_luminance"), Some(5));
    assert_eq!(f.value(&commit, plane, "max_luminance"), Some(1000));
}

#[test]
fn readback_toggles_modeset() {
    let mut f = Fixture::new();
    f.display.set_active_config(1, false).unwrap();
    f.display.deliver_win_config_data(&simple_frame()).unwrap();

    let mut with_readback = simple_frame();
    with_readback.readback = Some(buffer(99));
    let fences = f.display.deliver_win_config_data(&with_readback).unwrap();
    let commit = f.kms.last_commit();
    assert!(commit.flags.contains(AtomicFlags::ALLOW_MODESET));
    assert_ne!(
        f.value(&commit, WRITEBACK_CONNECTOR, "WRITEBACK_FB_ID"),
        Some(0)
    );
    assert_eq!(
        f.value(&commit, WRITEBACK_CONNECTOR, "CRTC_ID"),
        Some(u64::from(CRTC))
    );
    assert!(commit
        .fences
        .iter()
        .any(|fence| fence.slot == FenceSlot::Writeback));
    assert!(fences.readback.is_some());

    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    let commit = f.kms.last_commit();
    assert!(commit.flags.contains(AtomicFlags::ALLOW_MODESET));
    assert_eq!(
        f.value(&commit, WRITEBACK_CONNECTOR, "WRITEBACK_FB_ID"),
        Some(0)
    );
    assert_eq!(f.value(&commit, WRITEBACK_CONNECTOR, "CRTC_ID"), Some(0));

    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    let commit = f.kms.last_commit();
    assert_eq!(commit.flags, AtomicFlags::NONBLOCK);
    assert_eq!(
        f.value(&commit, WRITEBACK_CONNECTOR, "CRTC_ID"),
        None
    );
}

#[test]
fn partial_region_blob_follows_changes() {
    let mut f = Fixture::new();
    let region = |rect| Frame {
        partial_region: rect,
        ..simple_frame()
    };

    f.display
        .deliver_win_config_data(&region(Some(Rect::new(0, 0, 100, 100))))
        .unwrap();
    let first = f
        .value(&f.kms.last_commit(), CRTC, "partial_region")
        .unwrap() as u32;
    let clip: ClipRect = bytemuck::pod_read_unaligned(&f.kms.blob(first).unwrap());
    assert_eq!(
        clip,
        ClipRect {
            x1: 0,
            y1: 0,
            x2: 100,
            y2: 100
        }
    );

    f.display
        .deliver_win_config_data(&region(Some(Rect::new(0, 0, 100, 100))))
        .unwrap();
    assert_eq!(f.value(&f.kms.last_commit(), CRTC, "partial_region"), None);

    f.display
        .deliver_win_config_data(&region(Some(Rect::new(0, 100, 1080, 200))))
        .unwrap();
    let second = f
        .value(&f.kms.last_commit(), CRTC, "partial_region")
        .unwrap() as u32;
    assert_ne!(first, second);
    assert!(f.kms.destroyed_blobs().contains(&first));

    f.display.deliver_win_config_data(&region(None)).unwrap();
    assert_eq!(
        f.value(&f.kms.last_commit(), CRTC, "partial_region"),
        Some(0)
    );
    assert!(f.kms.destroyed_blobs().contains(&second));
}

#[test]
fn failed_commit_keeps_pending_state() {
    let mut f = Fixture::new();
    f.display.set_active_config(1, false).unwrap();
    f.kms.fail_next_commit(libc::EINVAL);

    let failing = Frame {
        partial_region: Some(Rect::new(0, 0, 10, 10)),
        ..simple_frame()
    };
    let blobs = f.kms.live_blobs();
    let err = f.display.deliver_win_config_data(&failing).unwrap_err();
    assert!(matches!(err, HwcError::Commit { errno } if errno == -libc::EINVAL));
    assert_eq!(f.kms.live_blobs(), blobs);
    assert_eq!(f.display.active_config(), None);
    assert_eq!(f.ctx.commit_stats().failed_commits, 1);

    f.display.deliver_win_config_data(&failing).unwrap();
    let commit = f.kms.last_commit();
    assert!(f.value(&commit, CRTC, "MODE_ID").is_some());
    assert!(f.value(&commit, CRTC, "partial_region").is_some());
    assert_eq!(f.display.active_config(), Some(1));
}

#[test]
fn secure_client_target_released_after_non_secure_composition() {
    let mut f = Fixture::new();
    let client_target = |buffer: BufferInfo| {
        let mut config = layer(0, 0, buffer);
        config.owner = FbOwner::ClientTarget;
        config
    };
    let protected = |id| BufferInfo {
        protected: true,
        ..buffer(id)
    };

    f.display
        .deliver_win_config_data(&frame(vec![client_target(protected(1))]))
        .unwrap();
    let secure_fb = f.value(&f.kms.last_commit(), PLANES[0], "FB_ID").unwrap() as u32;

    // A protected video layer does not keep the secure client target alive.
    f.display
        .deliver_win_config_data(&frame(vec![
            client_target(buffer(2)),
            layer(5, 1, protected(3)),
        ]))
        .unwrap();

    assert_eq!(f.kms.wait_removed_framebuffers(1), vec![secure_fb]);
    assert_eq!(
        f.display.framebuffers().cached_buffer_count(FbOwner::ClientTarget),
        1
    );
}

#[test]
fn out_of_memory_releases_all_framebuffers() {
    let mut f = Fixture::new();
    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    assert_eq!(f.display.framebuffers().cached_layer_count(), 1);

    f.kms.fail_next_add_framebuffer(libc::ENOMEM);
    let err = f
        .display
        .deliver_win_config_data(&frame(vec![
            layer(1, 0, buffer(10)),
            layer(2, 1, buffer(20)),
        ]))
        .unwrap_err();
    assert!(matches!(err, HwcError::NoMemory));
    assert_eq!(f.display.framebuffers().cached_layer_count(), 0);
}

#[test]
fn ghbm_transition_syncs_with_frame() {
    let mut f = Fixture::new();
    f.display.deliver_win_config_data(&simple_frame()).unwrap();

    f.display
        .brightness()
        .process_display_brightness(0.8, 0, false)
        .unwrap();
    f.display.deliver_win_config_data(&simple_frame()).unwrap();

    let commit = f.kms.last_commit();
    assert_eq!(
        f.value(&commit, CONNECTOR, "hbm_mode"),
        Some(HbmMode::OnIrcOn as u64)
    );
    assert!(f.value(&commit, CONNECTOR, "brightness_level").unwrap() > 2047);
    // sync_ghbm and sync_bl.
    assert_eq!(f.value(&commit, CONNECTOR, "mipi_sync"), Some(0b1100));
}

#[test]
fn config_applied_once_period_observed() {
    let mut f = Fixture::new();
    let period = |id: u32| {
        let mode = f.display.display_modes()[id as usize - 1];
        Duration::from_nanos(mode.vsync_period_ns())
    };
    let (p60, p120) = (period(1), period(2));

    f.kms.set_vblank_period(p60);
    f.display.set_active_config(1, false).unwrap();
    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    wait_until("config 1", || f.listener.applied() == [1]);

    f.kms.set_vblank_period(p120);
    f.display.set_active_config(2, false).unwrap();
    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    wait_until("config 2", || f.listener.applied() == [1, 2]);

    assert!(f.display.vsync_period_ns() > 0);
    // Nobody asked for vsync callbacks.
    assert_eq!(f.listener.vsyncs(), 0);
}

#[test]
fn vsync_callbacks_follow_enable() {
    let f = Fixture::new();
    f.display.set_vsync_enabled(true);
    wait_until("vsync", || f.listener.vsyncs() >= 2);

    f.display.set_vsync_enabled(false);
    thread::sleep(Duration::from_millis(20));
    let count = f.listener.vsyncs();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(f.listener.vsyncs(), count);
}

#[test]
fn power_cycle_forces_mode_set() {
    let mut f = Fixture::new();
    let dpms = f.kms.prop_id(CONNECTOR, "DPMS");

    f.display.set_active_config(1, false).unwrap();
    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    let blob = f.value(&f.kms.last_commit(), CRTC, "MODE_ID").unwrap();

    f.display.set_power_mode(PowerMode::Off).unwrap();
    assert_eq!(f.kms.legacy_writes(), vec![(CONNECTOR, dpms, 3)]);
    assert_eq!(f.display.framebuffers().cached_layer_count(), 0);

    f.display.set_power_mode(PowerMode::On).unwrap();
    assert_eq!(f.kms.legacy_writes().last(), Some(&(CONNECTOR, dpms, 0)));

    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    let commit = f.kms.last_commit();
    assert!(commit.flags.contains(AtomicFlags::ALLOW_MODESET));
    assert_eq!(f.value(&commit, CRTC, "MODE_ID"), Some(blob));
    assert_eq!(f.display.power_mode(), PowerMode::On);
}

#[test]
fn histogram_sees_every_commit() {
    let histogram = Arc::new(Histogram::default());
    let mut f = Fixture::with_histogram(Some(histogram.clone() as Arc<dyn HistogramCapable>));

    f.display.deliver_win_config_data(&simple_frame()).unwrap();
    f.kms.fail_next_commit(libc::EBUSY);
    f.display.deliver_win_config_data(&simple_frame()).unwrap_err();

    assert_eq!(*histogram.done.lock().unwrap(), vec![true, false]);
}

#[test]
fn drop_destroys_blobs() {
    let mut f = Fixture::new();
    f.display.set_active_config(1, false).unwrap();
    f.display
        .deliver_win_config_data(&Frame {
            partial_region: Some(Rect::new(0, 0, 10, 10)),
            ..simple_frame()
        })
        .unwrap();
    f.display.set_active_config(2, false).unwrap();

    let Fixture { kms, display, .. } = f;
    drop(display);
    // Only the brightness capability blob is left.
    assert_eq!(kms.live_blobs(), 1);
}

#[test]
fn dump_lists_modes() {
    let mut f = Fixture::new();
    f.display.set_active_config(2, false).unwrap();
    f.display.deliver_win_config_data(&simple_frame()).unwrap();

    let dump = f.display.dump();
    assert!(dump.contains("config 2: 1080x2400@120"), "{dump}");
    assert!(dump.contains("active"));
    assert!(dump.contains("planes: 50, 51, 52, 53"));
}
