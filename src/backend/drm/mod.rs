//! Display-level DRM interface.
//!
//! [`DisplayDrmInterface`] turns one frame of window configs into exactly one atomic commit:
//! readback, mode set, partial update region, plane state, brightness and histogram
//! properties all land in the same request.

pub mod atomic;
pub mod card;
pub mod device;
pub mod format;
pub mod framebuffer;
pub mod mode;
pub mod props;
pub mod types;
pub mod vsync;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use bytemuck::{Pod, Zeroable};
use tracing::{debug, error, info, trace, warn};

use self::atomic::{AtomicReq, ObjectLabels};
use self::device::{AtomicFlags, FenceSlot, KmsDevice, KmsResources, ObjectType};
use self::framebuffer::FramebufferManager;
use self::mode::{display_modes, DisplayMode, ModeChange, ModeState};
use self::props::{
    hal_transform_to_rotation, ConnectorProps, CrtcProps, MipiSync, PlaneProps, PropertySet,
    DATASPACE_RANGE_MASK, DATASPACE_STANDARD_MASK, DATASPACE_TRANSFER_MASK, TRANSFER_HLG,
    TRANSFER_ST2084,
};
use self::types::{FbOwner, Frame, FrameFences, PowerMode, Rect, WinConfig, WinConfigState};
use self::vsync::{VsyncTracker, VsyncWorker};
use crate::brightness::table::BrightnessTable;
use crate::brightness::BrightnessController;
use crate::capability::{
    DisplayCollaborators, DisplayColorCapable, DisplayEventListener, HistogramCapable,
};
use crate::context::HwcContext;
use crate::error::{HwcError, Result};

/// Which CRTC and connector drive a display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayTarget {
    pub display_id: u32,
    pub crtc_id: u32,
    pub connector_id: u32,
}

impl DisplayTarget {
    /// The first connected panel, driven by the first CRTC.
    pub fn primary(res: &KmsResources) -> Option<Self> {
        let connector = res.connectors.iter().find(|c| c.connected && !c.writeback)?;
        let crtc = res.crtcs.first()?;
        Some(Self {
            display_id: 0,
            crtc_id: crtc.id,
            connector_id: connector.id,
        })
    }
}

/// Planes pinned to one display. Other displays neither use nor disable them.
#[derive(Debug, Default)]
pub struct PlaneReservations {
    planes: Mutex<HashMap<u32, u32>>,
}

impl PlaneReservations {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, u32>> {
        self.planes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reserve(&self, plane_id: u32, display_id: u32) {
        debug!("plane {plane_id} reserved for display {display_id}");
        self.lock().insert(plane_id, display_id);
    }

    pub fn release(&self, plane_id: u32) {
        self.lock().remove(&plane_id);
    }

    pub fn is_reserved_by_other(&self, plane_id: u32, display_id: u32) -> bool {
        self.lock()
            .get(&plane_id)
            .is_some_and(|owner| *owner != display_id)
    }
}

/// Kernel `struct drm_clip_rect`, the payload of the `partial_region` blob.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
struct ClipRect {
    x1: u16,
    y1: u16,
    x2: u16,
    y2: u16,
}

impl From<Rect> for ClipRect {
    fn from(rect: Rect) -> Self {
        let clamp = |v: i64| v.clamp(0, i64::from(u16::MAX)) as u16;
        let x = i64::from(rect.x);
        let y = i64::from(rect.y);
        Self {
            x1: clamp(x),
            y1: clamp(y),
            x2: clamp(x + i64::from(rect.w)),
            y2: clamp(y + i64::from(rect.h)),
        }
    }
}

struct Plane {
    id: u32,
    props: PlaneProps,
}

struct Writeback {
    connector_id: u32,
    props: ConnectorProps,
}

/// State shared with the vsync thread.
struct VsyncShared {
    display_id: u32,
    tracker: Mutex<VsyncTracker>,
    /// Whether the composition pipeline asked for vsync callbacks.
    upstream: AtomicBool,
    listener: Option<Arc<dyn DisplayEventListener>>,
    brightness: Arc<BrightnessController>,
    modes: Vec<DisplayMode>,
    peak_refresh_rate: u32,
}

impl VsyncShared {
    fn tracker(&self) -> MutexGuard<'_, VsyncTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether hardware vsync is still needed.
    fn on_vsync(&self, timestamp: Duration) -> bool {
        let (applied, period_ns, pending) = {
            let mut tracker = self.tracker();
            let applied = tracker.on_vsync(timestamp);
            (applied, tracker.period_ns(), tracker.has_pending_config())
        };
        let upstream = self.upstream.load(Ordering::Acquire);

        if upstream {
            if let Some(listener) = &self.listener {
                listener.on_vsync(self.display_id, timestamp, period_ns);
            }
        }

        if let Some(config_id) = applied {
            if let Some(mode) = self.modes.iter().find(|mode| mode.id == config_id) {
                self.brightness
                    .set_peak_refresh_active(mode.refresh_rate() == self.peak_refresh_rate);
            }
            if let Some(listener) = &self.listener {
                listener.on_config_applied(self.display_id, config_id, timestamp);
            }
        }

        upstream || pending
    }
}

pub struct DisplayDrmInterface {
    vsync_worker: VsyncWorker,
    vsync: Arc<VsyncShared>,
    device: Arc<dyn KmsDevice>,
    ctx: Arc<HwcContext>,
    display_id: u32,
    crtc_id: u32,
    connector_id: u32,
    crtc_props: CrtcProps,
    connector_props: ConnectorProps,
    writeback: Option<Writeback>,
    planes: Vec<Plane>,
    labels: ObjectLabels,
    modes: Vec<DisplayMode>,
    desired_mode: ModeState,
    active_mode: ModeState,
    partial_region: Option<Rect>,
    partial_region_blob: u32,
    readback_active: bool,
    power_mode: PowerMode,
    reservations: Arc<PlaneReservations>,
    brightness: Arc<BrightnessController>,
    framebuffers: FramebufferManager,
    color: Option<Arc<dyn DisplayColorCapable>>,
    histogram: Option<Arc<dyn HistogramCapable>>,
}

impl DisplayDrmInterface {
    pub fn new(
        device: Arc<dyn KmsDevice>,
        ctx: Arc<HwcContext>,
        target: DisplayTarget,
        reservations: Arc<PlaneReservations>,
        collaborators: DisplayCollaborators,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("DisplayDrmInterface::new");

        let res = device.resources().context("error getting DRM resources")?;
        let crtc = res
            .crtcs
            .iter()
            .find(|crtc| crtc.id == target.crtc_id)
            .copied()
            .with_context(|| format!("CRTC {} not found", target.crtc_id))?;
        let connector = res
            .connectors
            .iter()
            .find(|conn| conn.id == target.connector_id && !conn.writeback)
            .with_context(|| format!("connector {} not found", target.connector_id))?;

        let mut labels = ObjectLabels::default();
        labels.insert(crtc.id, ObjectType::Crtc, crtc.pipe as usize);
        labels.insert(connector.id, ObjectType::Connector, 0);

        let set = PropertySet::query(&*device, crtc.id, ObjectType::Crtc)
            .context("error getting CRTC properties")?;
        let crtc_props = CrtcProps::resolve(&set);
        let set = PropertySet::query(&*device, connector.id, ObjectType::Connector)
            .context("error getting connector properties")?;
        let connector_props = ConnectorProps::resolve(&set);

        let writeback = match res.connectors.iter().find(|conn| conn.writeback) {
            Some(conn) => {
                labels.insert(conn.id, ObjectType::Connector, 1);
                let set = PropertySet::query(&*device, conn.id, ObjectType::Connector)
                    .context("error getting writeback connector properties")?;
                Some(Writeback {
                    connector_id: conn.id,
                    props: ConnectorProps::resolve(&set),
                })
            }
            None => None,
        };

        let crtc_mask = 1u32.checked_shl(crtc.pipe).unwrap_or(0);
        let mut planes = Vec::new();
        for desc in res.planes.iter().filter(|p| p.possible_crtcs & crtc_mask != 0) {
            labels.insert(desc.id, ObjectType::Plane, planes.len());
            let set = PropertySet::query(&*device, desc.id, ObjectType::Plane)
                .with_context(|| format!("error getting plane {} properties", desc.id))?;
            planes.push(Plane {
                id: desc.id,
                props: PlaneProps::resolve(&set),
            });
        }

        let modes = display_modes(&connector.modes);
        let peak_refresh_rate = modes
            .iter()
            .map(DisplayMode::refresh_rate)
            .max()
            .unwrap_or(0);

        let table = read_brightness_table(&*device, &connector_props);
        let brightness = Arc::new(BrightnessController::new(
            &ctx.config().panel,
            &connector_props,
            table,
            collaborators.listener.clone(),
            target.display_id,
        ));
        let framebuffers = FramebufferManager::new(device.clone(), ctx.config().framebuffer.clone());

        let vsync = Arc::new(VsyncShared {
            display_id: target.display_id,
            tracker: Mutex::new(VsyncTracker::new()),
            upstream: AtomicBool::new(false),
            listener: collaborators.listener,
            brightness: brightness.clone(),
            modes: modes.clone(),
            peak_refresh_rate,
        });
        let vsync_worker = {
            let vsync = vsync.clone();
            VsyncWorker::spawn(device.clone(), crtc.pipe, move |timestamp| {
                vsync.on_vsync(timestamp)
            })
        };

        info!(
            "display {}: CRTC {} connector {}, {} planes, {} modes, writeback {}",
            target.display_id,
            crtc.id,
            connector.id,
            planes.len(),
            modes.len(),
            if writeback.is_some() { "available" } else { "unavailable" },
        );

        Ok(Self {
            vsync_worker,
            vsync,
            device,
            ctx,
            display_id: target.display_id,
            crtc_id: crtc.id,
            connector_id: connector.id,
            crtc_props,
            connector_props,
            writeback,
            planes,
            labels,
            modes,
            desired_mode: ModeState::default(),
            active_mode: ModeState::default(),
            partial_region: None,
            partial_region_blob: 0,
            readback_active: false,
            power_mode: PowerMode::Off,
            reservations,
            brightness,
            framebuffers,
            color: collaborators.color,
            histogram: collaborators.histogram,
        })
    }

    pub fn display_id(&self) -> u32 {
        self.display_id
    }

    pub fn crtc_id(&self) -> u32 {
        self.crtc_id
    }

    pub fn connector_id(&self) -> u32 {
        self.connector_id
    }

    pub fn connector_props(&self) -> &ConnectorProps {
        &self.connector_props
    }

    pub fn display_modes(&self) -> &[DisplayMode] {
        &self.modes
    }

    /// Id of the mode of the last successful mode set.
    pub fn active_config(&self) -> Option<u32> {
        self.active_mode.mode.map(|mode| mode.id)
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power_mode
    }

    pub fn brightness(&self) -> &BrightnessController {
        &self.brightness
    }

    /// The cache the composition pipeline releases destroyed layers from.
    pub fn framebuffers(&self) -> &FramebufferManager {
        &self.framebuffers
    }

    /// Observed vsync period, 0 until hardware vsync has run for two frames.
    pub fn vsync_period_ns(&self) -> u64 {
        self.vsync.tracker().period_ns()
    }

    /// Makes `config_id` the mode of the next frame.
    ///
    /// With `test_only` the mode is only checked against the kernel and nothing changes.
    pub fn set_active_config(&mut self, config_id: u32, test_only: bool) -> Result<()> {
        let _span = tracy_client::span!("DisplayDrmInterface::set_active_config");

        let mode = *self
            .modes
            .iter()
            .find(|mode| mode.id == config_id)
            .ok_or(HwcError::BadConfig(config_id))?;
        let blob_id = self
            .device
            .create_blob(bytemuck::bytes_of(&mode.info))
            .map_err(|err| HwcError::drm("create mode blob", err))?;

        let mut req = AtomicReq::new(&*self.device, &self.ctx, &self.labels);
        if test_only {
            req.add_old_blob(blob_id);
            req.add_property(self.crtc_id, &self.crtc_props.active, 1, false)?;
            req.add_property(self.crtc_id, &self.crtc_props.mode_id, u64::from(blob_id), false)?;
            req.add_property(
                self.connector_id,
                &self.connector_props.crtc_id,
                u64::from(self.crtc_id),
                false,
            )?;
            req.commit(
                AtomicFlags::TEST_ONLY | AtomicFlags::ALLOW_MODESET,
                self.ctx.atomic_commit_logging(),
            )?;
            return Ok(());
        }

        debug!(
            "display {}: desired config {config_id} ({}x{}@{})",
            self.display_id,
            mode.width(),
            mode.height(),
            mode.refresh_rate()
        );
        self.desired_mode
            .set_desired_mode(&self.active_mode, mode, blob_id, &mut req);
        Ok(())
    }

    /// Commits one frame and returns its fences.
    ///
    /// Running out of memory for framebuffers releases the whole cache so the next frame can
    /// start over.
    pub fn deliver_win_config_data(&mut self, frame: &Frame) -> Result<FrameFences> {
        let _span = tracy_client::span!("DisplayDrmInterface::deliver_win_config_data");

        match self.commit_frame(frame) {
            Err(HwcError::NoMemory) => {
                error!(
                    "display {}: out of memory, releasing all framebuffers",
                    self.display_id
                );
                self.framebuffers.release_all();
                Err(HwcError::NoMemory)
            }
            res => res,
        }
    }

    fn commit_frame(&mut self, frame: &Frame) -> Result<FrameFences> {
        self.framebuffers.check_shrink();

        let mut req = AtomicReq::new(&*self.device, &self.ctx, &self.labels);
        let mut flags = AtomicFlags::NONBLOCK;

        let readback = frame.readback.is_some();
        match (&frame.readback, &self.writeback) {
            (Some(buffer), Some(wb)) => {
                let fb_id = self.framebuffers.get_writeback_buffer(buffer)?;
                req.add_property(
                    wb.connector_id,
                    &wb.props.writeback_fb_id,
                    u64::from(fb_id),
                    false,
                )?;
                req.add_out_fence(
                    wb.connector_id,
                    &wb.props.writeback_out_fence_ptr,
                    FenceSlot::Writeback,
                )?;
                req.add_property(
                    wb.connector_id,
                    &wb.props.crtc_id,
                    u64::from(self.crtc_id),
                    false,
                )?;
            }
            (Some(_), None) => return Err(HwcError::Unsupported("readback")),
            (None, Some(wb)) if self.readback_active => {
                req.add_property(wb.connector_id, &wb.props.writeback_fb_id, 0, false)?;
                req.add_property(wb.connector_id, &wb.props.crtc_id, 0, false)?;
            }
            (None, _) => (),
        }
        if readback != self.readback_active {
            flags |= AtomicFlags::ALLOW_MODESET;
        }

        let mut mode_set = false;
        let mut refresh_rate_sync = false;
        if self.desired_mode.needs_mode_set() {
            let blob_id = if self.desired_mode.mode.is_some() {
                self.desired_mode.blob_id
            } else {
                self.active_mode.blob_id
            };

            if blob_id == 0 {
                warn!("display {}: mode set without a mode", self.display_id);
            } else {
                req.add_property(self.crtc_id, &self.crtc_props.active, 1, false)?;
                req.add_property(self.crtc_id, &self.crtc_props.mode_id, u64::from(blob_id), false)?;
                req.add_property(
                    self.connector_id,
                    &self.connector_props.crtc_id,
                    u64::from(self.crtc_id),
                    false,
                )?;
                mode_set = true;

                if self.desired_mode.is_seamless() {
                    refresh_rate_sync = self
                        .desired_mode
                        .changes()
                        .contains(ModeChange::REFRESH_RATE);
                } else {
                    flags |= AtomicFlags::ALLOW_MODESET;
                }
            }
        }

        // The new blob is destroyed with the request unless the commit goes through.
        let mut new_partial_region = None;
        if frame.partial_region != self.partial_region
            && self.crtc_props.partial_region.is_available()
        {
            let blob_id = match frame.partial_region {
                Some(rect) => self
                    .device
                    .create_blob(bytemuck::bytes_of(&ClipRect::from(rect)))
                    .map_err(|err| HwcError::drm("create partial region blob", err))?,
                None => 0,
            };
            req.add_old_blob(blob_id);
            req.add_property(
                self.crtc_id,
                &self.crtc_props.partial_region,
                u64::from(blob_id),
                true,
            )?;
            new_partial_region = Some((frame.partial_region, blob_id));
        }

        req.add_out_fence(self.crtc_id, &self.crtc_props.out_fence_ptr, FenceSlot::Retire)?;

        let mut used = vec![false; self.planes.len()];
        let mut has_secure_frame = false;
        for (index, config) in frame.configs.iter().enumerate() {
            if !config.is_enabled() {
                continue;
            }

            let plane = self.planes.get(config.plane).ok_or_else(|| {
                HwcError::BadValue(format!("display has no plane {}", config.plane))
            })?;
            if self.reservations.is_reserved_by_other(plane.id, self.display_id) {
                return Err(HwcError::BadValue(format!(
                    "plane {} is reserved by another display",
                    plane.id
                )));
            }
            if std::mem::replace(&mut used[config.plane], true) {
                return Err(HwcError::BadValue(format!(
                    "plane {} assigned twice",
                    plane.id
                )));
            }

            let fb_id = self.framebuffers.get_buffer(config)?;
            queue_plane(&mut req, self.crtc_id, plane, index, config, fb_id)?;
            has_secure_frame |= config.owner == FbOwner::ClientTarget && config.is_protected();
        }

        for (plane, used) in self.planes.iter().zip(&used) {
            if *used || self.reservations.is_reserved_by_other(plane.id, self.display_id) {
                continue;
            }
            req.add_property(plane.id, &plane.props.fb_id, 0, false)?;
            req.add_property(plane.id, &plane.props.crtc_id, 0, false)?;
        }

        let sync = self.brightness.prepare_frame_commit(
            self.connector_id,
            &self.connector_props,
            &mut req,
            frame.mixed_composition,
            self.color.as_deref(),
        )?;
        let mut mipi_sync = 0u64;
        for (needed, kind) in [
            (refresh_rate_sync, MipiSync::RefreshRate),
            (sync.lhbm, MipiSync::Lhbm),
            (sync.ghbm, MipiSync::Ghbm),
            (sync.backlight, MipiSync::Backlight),
        ] {
            if !needed {
                continue;
            }
            match self.connector_props.mipi_sync_bits.get(kind as u64) {
                Ok(bit) => mipi_sync |= 1 << bit,
                Err(err) => trace!("{err}"),
            }
        }
        if mipi_sync != 0 {
            req.add_property(
                self.connector_id,
                &self.connector_props.mipi_sync,
                mipi_sync,
                true,
            )?;
        }

        if let Some(histogram) = &self.histogram {
            histogram.prepare_histogram_commit(self.crtc_id, &mut req)?;
        }

        let result = req.commit(flags, self.ctx.atomic_commit_logging());
        if let Some(histogram) = &self.histogram {
            histogram.on_commit_done(result.is_ok());
        }
        let fences = result?;

        let retire = fences.retire.map(Arc::new);
        let release = frame
            .configs
            .iter()
            .map(|config| {
                if !matches!(config.state, WinConfigState::Buffer(_)) {
                    return None;
                }
                match retire.as_ref()?.try_clone() {
                    Ok(fd) => Some(Arc::new(fd)),
                    Err(err) => {
                        warn!("error duplicating release fence: {err}");
                        None
                    }
                }
            })
            .collect();

        if let Some((region, blob_id)) = new_partial_region {
            req.forget_old_blob(blob_id);
            req.add_old_blob(self.partial_region_blob);
            self.partial_region = region;
            self.partial_region_blob = blob_id;
        }

        if mode_set {
            if let Some(mode) = self.desired_mode.mode {
                self.vsync
                    .tracker()
                    .set_desired(mode.id, mode.vsync_period_ns());
                self.vsync_worker.set_enabled(true);
            }
            self.desired_mode.apply(&mut self.active_mode, &mut req);
            self.active_mode.clear_pending_changes();
        }

        self.readback_active = readback;
        self.framebuffers.flip(has_secure_frame);

        Ok(FrameFences {
            retire,
            release,
            readback: fences.writeback,
        })
    }

    pub fn set_power_mode(&mut self, mode: PowerMode) -> Result<()> {
        let _span = tracy_client::span!("DisplayDrmInterface::set_power_mode");

        let dpms = &self.connector_props.dpms;
        if dpms.is_available() {
            let entry = if mode.is_on() { "On" } else { "Off" };
            let value = dpms
                .enum_value(entry)
                .ok_or_else(|| HwcError::BadValue(format!("DPMS has no {entry} entry")))?;
            self.device
                .set_connector_property(self.connector_id, dpms.id(), value)
                .map_err(|err| HwcError::drm("set DPMS", err))?;
        }

        self.brightness.set_power_mode(mode);

        if mode.is_on() {
            if !self.power_mode.is_on() {
                self.desired_mode.force_mode_set();
            }
        } else {
            self.framebuffers.release_all();
            self.vsync.tracker().reset_timestamps();
        }

        info!(
            "display {}: power {:?} -> {mode:?}",
            self.display_id, self.power_mode
        );
        self.power_mode = mode;
        Ok(())
    }

    /// Turns vsync callbacks to the listener on or off.
    ///
    /// Hardware vsync stays on while a config change is still being verified.
    pub fn set_vsync_enabled(&self, enabled: bool) {
        self.vsync.upstream.store(enabled, Ordering::Release);
        if enabled || !self.vsync.tracker().has_pending_config() {
            self.vsync_worker.set_enabled(enabled);
        }
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "display {}: CRTC {} connector {}, power {:?}",
            self.display_id, self.crtc_id, self.connector_id, self.power_mode
        );
        for mode in &self.modes {
            let _ = writeln!(
                out,
                "  config {}: {}x{}@{} ({}ns){}",
                mode.id,
                mode.width(),
                mode.height(),
                mode.refresh_rate(),
                mode.vsync_period_ns(),
                if self.active_config() == Some(mode.id) { " active" } else { "" },
            );
        }
        let planes: Vec<String> = self.planes.iter().map(|p| p.id.to_string()).collect();
        let _ = writeln!(out, "  planes: {}", planes.join(", "));
        let _ = writeln!(
            out,
            "  readback {}, partial region {:?}",
            if self.readback_active { "on" } else { "off" },
            self.partial_region
        );
        out.push_str(&self.brightness.dump());
        out
    }
}

impl Drop for DisplayDrmInterface {
    fn drop(&mut self) {
        let mut req = AtomicReq::new(&*self.device, &self.ctx, &self.labels);
        self.desired_mode.clear(&mut req);
        self.active_mode.clear(&mut req);
        req.add_old_blob(self.partial_region_blob);
    }
}

fn read_brightness_table(device: &dyn KmsDevice, props: &ConnectorProps) -> Option<BrightnessTable> {
    let blob_id = props
        .brightness_capability
        .initial_value()
        .filter(|&id| id != 0)?;

    let data = match device.property_blob(blob_id) {
        Ok(data) => data,
        Err(err) => {
            warn!("error reading brightness capability blob {blob_id}: {err}");
            return None;
        }
    };

    match BrightnessTable::from_blob(&data) {
        Ok(table) => Some(table),
        Err(err) => {
            warn!("invalid brightness capability: {err}");
            None
        }
    }
}

fn queue_plane(
    req: &mut AtomicReq<'_>,
    crtc_id: u32,
    plane: &Plane,
    zorder: usize,
    config: &WinConfig,
    fb_id: u32,
) -> Result<()> {
    let id = plane.id;
    let props = &plane.props;
    let dst = config.dst;
    let src = match config.state {
        WinConfigState::Color(_) => Rect::new(0, 0, dst.w, dst.h),
        _ => config.src,
    };

    req.add_property(id, &props.fb_id, u64::from(fb_id), false)?;
    req.add_property(id, &props.crtc_id, u64::from(crtc_id), false)?;
    req.add_property(id, &props.crtc_x, i64::from(dst.x) as u64, false)?;
    req.add_property(id, &props.crtc_y, i64::from(dst.y) as u64, false)?;
    req.add_property(id, &props.crtc_w, u64::from(dst.w), false)?;
    req.add_property(id, &props.crtc_h, u64::from(dst.h), false)?;
    // 16.16 fixed point.
    req.add_property(id, &props.src_x, (src.x.max(0) as u64) << 16, false)?;
    req.add_property(id, &props.src_y, (src.y.max(0) as u64) << 16, false)?;
    req.add_property(id, &props.src_w, u64::from(src.w) << 16, false)?;
    req.add_property(id, &props.src_h, u64::from(src.h) << 16, false)?;

    if props.rotation.is_available() {
        let rotation = hal_transform_to_rotation(config.transform)?;
        req.add_property(id, &props.rotation, rotation, true)?;
    } else if config.transform != 0 {
        return Err(HwcError::BadValue(format!("plane {id} cannot rotate")));
    }

    if let Some((min, _)) = props.zpos.range() {
        req.add_property(id, &props.zpos, zorder as u64 + min, true)?;
    }

    if props.blend.is_available() {
        let blend = props.blend_modes.get(config.blending as u64)?;
        req.add_property(id, &props.blend, blend, true)?;
    }

    if let Some((_, max)) = props.alpha.range() {
        let alpha = (config.plane_alpha.clamp(0., 1.) * max as f32).round() as u64;
        req.add_property(id, &props.alpha, alpha, true)?;
    }

    if let Some(fence) = &config.acquire_fence {
        req.add_property(id, &props.in_fence_fd, fence.as_raw_fd() as u64, true)?;
    }

    match config.state {
        WinConfigState::Color(color) => {
            req.add_property(id, &props.colormap, u64::from(color), true)?;
        }
        WinConfigState::Buffer(_) => queue_dataspace(req, id, props, config)?,
        WinConfigState::Disabled => (),
    }

    Ok(())
}

fn queue_dataspace(
    req: &mut AtomicReq<'_>,
    id: u32,
    props: &PlaneProps,
    config: &WinConfig,
) -> Result<()> {
    let dataspace = config.dataspace;

    if props.standard.is_available() {
        let value = props
            .standards
            .get(u64::from(dataspace & DATASPACE_STANDARD_MASK))?;
        req.add_property(id, &props.standard, value, true)?;
    }
    if props.transfer.is_available() {
        let value = props
            .transfers
            .get(u64::from(dataspace & DATASPACE_TRANSFER_MASK))?;
        req.add_property(id, &props.transfer, value, true)?;
    }
    if props.range.is_available() {
        let value = props.ranges.get(u64::from(dataspace & DATASPACE_RANGE_MASK))?;
        req.add_property(id, &props.range, value, true)?;
    }

    let transfer = dataspace & DATASPACE_TRANSFER_MASK;
    if transfer == TRANSFER_ST2084 || transfer == TRANSFER_HLG {
        req.add_property(id, &props.min_luminance, u64::from(config.min_luminance), true)?;
        req.add_property(id, &props.max_luminance, u64::from(config.max_luminance), true)?;
    }

    Ok(())
}
