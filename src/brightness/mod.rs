//! Brightness, HBM, dimming and CABC state reconciliation.
//!
//! Several producers (the brightness service, the sensor HAL for local HBM, the power HAL)
//! store requests; [`BrightnessController`] turns them into the panel state for the next
//! frame. Plain brightness changes go straight to the `brightness` sysfs node. Anything that
//! has to change together with the picture (global HBM transitions, local HBM, dimming) is
//! queued as connector properties on the next atomic commit by
//! [`BrightnessController::prepare_frame_commit`].

use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hwc_config::{DimmingUsage, Panel};
use tracing::{debug, info, warn};

use self::dimming::DimmingTimer;
use self::sysfs::{check_sysfs_status, SysfsNode};
use self::table::{BrightnessQuery, BrightnessRange, BrightnessTable};
use crate::backend::drm::atomic::AtomicReq;
use crate::backend::drm::props::{ConnectorProps, HbmMode};
use crate::backend::drm::types::PowerMode;
use crate::capability::{DisplayColorCapable, DisplayEventListener};
use crate::error::{HwcError, Result};
use crate::utils::DirtyCell;

mod dimming;
pub mod sysfs;
pub mod table;
mod types;

pub use self::types::{BrightnessCaps, CabcMode, FrameSyncFlags};

/// Relative luminance jump above which a brightness change in a mixed-composition frame is
/// synchronised with that frame.
const MIXED_COMPOSITION_SYNC_THRESHOLD: f32 = 0.5;

/// Used when neither `max_brightness` nor a brightness table is available.
const DEFAULT_MAX_BRIGHTNESS: u32 = 255;

struct Nodes {
    brightness: SysfsNode,
    max_brightness: SysfsNode,
    dim_brightness: SysfsNode,
    local_hbm_mode: SysfsNode,
    hbm_mode: SysfsNode,
    cabc_mode: SysfsNode,
}

impl Nodes {
    fn new(dir: &Path) -> Self {
        Self {
            brightness: SysfsNode::new(dir.join("brightness")),
            max_brightness: SysfsNode::new(dir.join("max_brightness")),
            dim_brightness: SysfsNode::new(dir.join("dim_brightness")),
            local_hbm_mode: SysfsNode::new(dir.join("local_hbm_mode")),
            hbm_mode: SysfsNode::new(dir.join("hbm_mode")),
            cabc_mode: SysfsNode::new(dir.join("cabc_mode")),
        }
    }
}

struct State {
    // Requests.
    brightness_float_req: DirtyCell<f32>,
    lhbm_req: DirtyCell<bool>,
    enhance_hbm_req: DirtyCell<bool>,
    instant_hbm_req: DirtyCell<bool>,
    dim_brightness_req: DirtyCell<bool>,
    cabc_req: DirtyCell<CabcMode>,

    // Derived, written only by `update_states_locked()` and its helpers.
    brightness_level: DirtyCell<u32>,
    ghbm: DirtyCell<HbmMode>,
    dimming: DirtyCell<bool>,
    lhbm: DirtyCell<bool>,
    cabc: DirtyCell<CabcMode>,

    brightness_nits: f32,
    /// Nits at the previous frame commit.
    committed_nits: f32,
    /// With `DimmingUsage::Hbm`: inside the window after a global HBM transition.
    hbm_dimming: bool,
    /// This frame straddles a large luminance jump in mixed composition.
    mixed_sync: bool,
    /// The last committed frame mixed GPU and direct scanout layers.
    last_frame_mixed: bool,
    lhbm_brightness_adjusted: bool,

    /// Panel state committed through the atomic path that sysfs has not confirmed yet.
    unchecked_ghbm_status: Option<HbmMode>,
    unchecked_lhbm_status: Option<bool>,

    ignore_updates: bool,
    power_on: bool,
    peak_refresh: bool,
}

impl State {
    fn new(usage: DimmingUsage) -> Self {
        let mut dimming = DirtyCell::new(false);
        if usage == DimmingUsage::Normal {
            dimming.update(true);
        }

        Self {
            brightness_float_req: DirtyCell::new(-1.),
            lhbm_req: DirtyCell::new(false),
            enhance_hbm_req: DirtyCell::new(false),
            instant_hbm_req: DirtyCell::new(false),
            dim_brightness_req: DirtyCell::new(false),
            cabc_req: DirtyCell::new(CabcMode::Off),
            brightness_level: DirtyCell::new(0),
            ghbm: DirtyCell::new(HbmMode::Off),
            dimming,
            lhbm: DirtyCell::new(false),
            cabc: DirtyCell::new(CabcMode::Off),
            brightness_nits: 0.,
            committed_nits: 0.,
            hbm_dimming: false,
            mixed_sync: false,
            last_frame_mixed: false,
            lhbm_brightness_adjusted: false,
            unchecked_ghbm_status: None,
            unchecked_lhbm_status: None,
            ignore_updates: false,
            power_on: false,
            peak_refresh: false,
        }
    }

    fn clear_request_dirty(&mut self) {
        self.brightness_float_req.clear_dirty();
        self.lhbm_req.clear_dirty();
        self.enhance_hbm_req.clear_dirty();
        self.instant_hbm_req.clear_dirty();
        self.dim_brightness_req.clear_dirty();
        self.cabc_req.clear_dirty();
    }
}

struct Shared {
    panel: Panel,
    caps: BrightnessCaps,
    table: Option<BrightnessTable>,
    max_brightness: u32,
    nodes: Nodes,
    listener: Option<Arc<dyn DisplayEventListener>>,
    display_id: u32,
    state: Mutex<State>,
    /// Signalled on power mode and refresh rate changes.
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_refresh(&self) {
        if let Some(listener) = &self.listener {
            listener.on_refresh_requested(self.display_id);
        }
    }

    fn instant_hbm_brightness(&self) -> f32 {
        self.table
            .as_ref()
            .map_or(1., |table| table.range(BrightnessRange::Hbm).bri_end)
    }

    fn query_brightness(&self, brightness: f32) -> Result<BrightnessQuery> {
        if let Some(table) = &self.table {
            return table.query(brightness);
        }

        if brightness < 0. {
            return Ok(BrightnessQuery::OFF);
        }
        let level = brightness * self.max_brightness.saturating_sub(1) as f32 + 1. + 0.5;
        Ok(BrightnessQuery {
            level: level as u32,
            ghbm: false,
            nits: 0.,
        })
    }

    /// Whether going from `prev` to `cur` nits needs the backlight synced with a mixed
    /// composition frame.
    fn is_mixed_sync_jump(&self, prev: f32, cur: f32) -> bool {
        self.panel.brightness_dimming_usage == DimmingUsage::Normal
            && prev > 0.
            && cur > 0.
            && (prev - cur).abs() / prev.min(cur) > MIXED_COMPOSITION_SYNC_THRESHOLD
    }

    /// Recomputes every derived cell from the requests.
    ///
    /// Returns whether the HBM dimming window needs to (re)start.
    fn update_states_locked(&self, st: &mut State) -> Result<bool> {
        let brightness = if st.instant_hbm_req.get() {
            self.instant_hbm_brightness()
        } else {
            st.brightness_float_req.get()
        };
        let query = self.query_brightness(brightness)?;

        let ghbm_on = query.ghbm && self.caps.ghbm && !st.dim_brightness_req.get();
        let hbm_mode = match (ghbm_on, st.enhance_hbm_req.get()) {
            (false, _) => HbmMode::Off,
            (true, false) => HbmMode::OnIrcOn,
            // IRC off trades colour accuracy for sunlight visibility.
            (true, true) => HbmMode::OnIrcOff,
        };
        let ghbm_changed = (st.ghbm.get() != HbmMode::Off) != ghbm_on;

        st.ghbm.update(hbm_mode);
        st.brightness_level.update(query.level);
        st.brightness_nits = query.nits;
        st.lhbm.update(st.lhbm_req.get());

        let mut start_hbm_dimming = false;
        if ghbm_changed && self.panel.brightness_dimming_usage == DimmingUsage::Hbm {
            st.hbm_dimming = true;
            start_hbm_dimming = true;
        }
        self.update_dimming_locked(st);

        let cabc = if hbm_mode == HbmMode::Off {
            st.cabc_req.get()
        } else {
            CabcMode::Off
        };
        st.cabc.update(cabc);

        st.clear_request_dirty();
        self.print_states(st);
        Ok(start_hbm_dimming)
    }

    fn update_dimming_locked(&self, st: &mut State) {
        let dimming = match self.panel.brightness_dimming_usage {
            DimmingUsage::Normal => !st.instant_hbm_req.get() && !st.mixed_sync,
            DimmingUsage::Hbm => st.hbm_dimming,
            DimmingUsage::None => false,
        };
        st.dimming.update(dimming);
    }

    fn process_dimming_off(&self) {
        let dirty = {
            let mut st = self.lock();
            st.hbm_dimming = false;
            self.update_dimming_locked(&mut st);
            st.dimming.is_dirty()
        };

        if dirty {
            debug!("HBM dimming window over");
            self.request_refresh();
        }
    }

    /// Waits for atomic-path panel transitions to show up in sysfs.
    fn check_unchecked_statuses_locked(&self, st: &mut State, timeout: Duration) {
        if let Some(mode) = st.unchecked_ghbm_status.take() {
            if self.nodes.hbm_mode.exists() {
                let expected = (mode as u64).to_string();
                if let Err(err) = check_sysfs_status(self.nodes.hbm_mode.path(), &[&expected], timeout) {
                    warn!("global HBM {mode:?} not confirmed: {err}");
                }
            }
        }

        if let Some(on) = st.unchecked_lhbm_status.take() {
            if self.nodes.local_hbm_mode.exists() {
                let expected = if on { "1" } else { "0" };
                if let Err(err) =
                    check_sysfs_status(self.nodes.local_hbm_mode.path(), &[expected], timeout)
                {
                    warn!("local HBM {on} not confirmed: {err}");
                }
            }
        }
    }

    fn reset_locked(&self, st: &mut State) {
        let power_on = st.power_on;
        let peak_refresh = st.peak_refresh;
        let ignore_updates = st.ignore_updates;

        *st = State::new(self.panel.brightness_dimming_usage);
        st.power_on = power_on;
        st.peak_refresh = peak_refresh;
        st.ignore_updates = ignore_updates;
    }

    fn print_states(&self, st: &State) {
        debug!(
            "brightness req={:.4} level={} nits={:.1} ghbm={:?} lhbm={} dimming={} cabc={:?}",
            st.brightness_float_req.get(),
            st.brightness_level.get(),
            st.brightness_nits,
            st.ghbm.get(),
            st.lhbm.get(),
            st.dimming.get(),
            st.cabc.get(),
        );
    }
}

pub struct BrightnessController {
    shared: Arc<Shared>,
    dimming_timer: Option<DimmingTimer>,
}

impl BrightnessController {
    pub fn new(
        panel: &Panel,
        props: &ConnectorProps,
        table: Option<BrightnessTable>,
        listener: Option<Arc<dyn DisplayEventListener>>,
        display_id: u32,
    ) -> Self {
        let nodes = Nodes::new(&panel.backlight_dir());

        let fallback = table.as_ref().map_or(DEFAULT_MAX_BRIGHTNESS, |table| {
            table.range(BrightnessRange::Hbm).bkl_end
        });
        let max_brightness = match nodes.max_brightness.read_value::<u32>() {
            Ok(0) => {
                warn!("max brightness reads as 0, using {fallback}");
                fallback
            }
            Ok(max) => max,
            Err(err) => {
                warn!("error reading max brightness, using {fallback}: {err}");
                fallback
            }
        };

        let caps = BrightnessCaps {
            lhbm: props.lhbm_on.is_available(),
            ghbm: props.hbm_mode.is_available() && !props.hbm_modes.is_empty(),
            dimming: props.dimming_on.is_available(),
            cabc: nodes.cabc_mode.exists(),
            dim_brightness: nodes.dim_brightness.exists(),
        };
        info!(
            "panel{} brightness: {caps:?}, max {max_brightness}, table {}",
            panel.index,
            if table.is_some() { "present" } else { "absent" }
        );

        let shared = Arc::new(Shared {
            panel: panel.clone(),
            caps,
            table,
            max_brightness,
            nodes,
            listener,
            display_id,
            state: Mutex::new(State::new(panel.brightness_dimming_usage)),
            changed: Condvar::new(),
        });

        let dimming_timer = (panel.brightness_dimming_usage == DimmingUsage::Hbm).then(|| {
            let weak = Arc::downgrade(&shared);
            DimmingTimer::spawn(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.process_dimming_off();
                }
            })
        });

        Self {
            shared,
            dimming_timer,
        }
    }

    pub fn caps(&self) -> BrightnessCaps {
        self.shared.caps
    }

    pub fn table(&self) -> Option<&BrightnessTable> {
        self.shared.table.as_ref()
    }

    fn after_state_change(&self, start_hbm_dimming: bool) {
        if start_hbm_dimming {
            if let Some(timer) = &self.dimming_timer {
                timer.schedule(self.shared.panel.hbm_dimming_time());
            }
        }

        self.shared.request_refresh();

        if let Err(err) = self.apply_pending_cabc() {
            warn!("error applying CABC mode: {err}");
        }
    }

    /// Stores a request and, if it changed anything, recomputes the derived state.
    fn process_request(&self, store: impl FnOnce(&mut State) -> bool) -> Result<()> {
        let start_hbm_dimming = {
            let mut st = self.shared.lock();
            if !store(&mut st) {
                return Ok(());
            }
            self.shared.update_states_locked(&mut st)?
        };

        self.after_state_change(start_hbm_dimming);
        Ok(())
    }

    /// Applies a brightness in `0.0..=1.0`, or turns the backlight off for negative values.
    ///
    /// Plain changes are written to sysfs right away. Global HBM transitions, large jumps
    /// after a mixed composition frame and any change with `wait_present` are deferred to the
    /// next frame commit.
    pub fn process_display_brightness(
        &self,
        brightness: f32,
        vsync_ns: u64,
        wait_present: bool,
    ) -> Result<()> {
        let _span = tracy_client::span!("BrightnessController::process_display_brightness");
        let shared = &*self.shared;

        let mut st = shared.lock();
        if st.ignore_updates {
            debug!("ignoring brightness {brightness}");
            return Ok(());
        }

        let prev = st.brightness_float_req.get();
        st.brightness_float_req.store(brightness);
        if !st.brightness_float_req.is_dirty() {
            return Ok(());
        }

        let query = match shared.query_brightness(brightness) {
            Ok(query) => query,
            Err(err) => {
                st.brightness_float_req.reset(prev);
                return Err(err);
            }
        };

        let ghbm_on = st.ghbm.get() != HbmMode::Off;
        let ghbm_transition =
            shared.caps.ghbm && !st.dim_brightness_req.get() && query.ghbm != ghbm_on;

        let mixed_jump =
            st.last_frame_mixed && shared.is_mixed_sync_jump(st.brightness_nits, query.nits);

        if ghbm_transition || mixed_jump || wait_present || st.instant_hbm_req.get() {
            let start_hbm_dimming = shared.update_states_locked(&mut st)?;
            drop(st);
            self.after_state_change(start_hbm_dimming);
            return Ok(());
        }

        let timeout = if vsync_ns > 0 {
            Duration::from_nanos(vsync_ns.saturating_mul(5))
        } else {
            shared.panel.sysfs_check_timeout()
        };
        shared.check_unchecked_statuses_locked(&mut st, timeout);

        let node = if st.dim_brightness_req.get() && shared.caps.dim_brightness {
            &shared.nodes.dim_brightness
        } else {
            &shared.nodes.brightness
        };
        if let Err(err) = node.write_value(query.level) {
            st.brightness_float_req.reset(prev);
            return Err(err);
        }

        st.brightness_level.reset(query.level);
        st.brightness_nits = query.nits;
        st.committed_nits = query.nits;
        st.brightness_float_req.clear_dirty();
        shared.print_states(&st);
        Ok(())
    }

    /// Sunlight mode: global HBM without IR compensation.
    pub fn process_enhanced_hbm(&self, on: bool) -> Result<()> {
        if !self.shared.caps.ghbm {
            return Err(HwcError::Unsupported("global HBM"));
        }
        self.process_request(|st| {
            st.enhance_hbm_req.store(on);
            st.enhance_hbm_req.is_dirty()
        })
    }

    /// Jumps straight to peak HBM brightness, without dimming.
    pub fn process_instant_hbm(&self, on: bool) -> Result<()> {
        if !self.shared.caps.ghbm {
            return Err(HwcError::Unsupported("global HBM"));
        }
        self.process_request(|st| {
            st.instant_hbm_req.store(on);
            st.instant_hbm_req.is_dirty()
        })
    }

    pub fn process_local_hbm(&self, on: bool) -> Result<()> {
        if !self.shared.caps.lhbm {
            return Err(HwcError::Unsupported("local HBM"));
        }
        self.process_request(|st| {
            st.lhbm_req.store(on);
            st.lhbm_req.is_dirty()
        })
    }

    /// While on, global HBM is suppressed and levels go to the `dim_brightness` node.
    pub fn process_dim_brightness(&self, on: bool) -> Result<()> {
        if !self.shared.caps.dim_brightness {
            return Err(HwcError::Unsupported("dim brightness"));
        }
        self.process_request(|st| {
            st.dim_brightness_req.store(on);
            st.dim_brightness_req.is_dirty()
        })
    }

    pub fn process_cabc(&self, mode: CabcMode) -> Result<()> {
        if !self.shared.caps.cabc {
            return Err(HwcError::Unsupported("CABC"));
        }
        self.process_request(|st| {
            st.cabc_req.store(mode);
            st.cabc_req.is_dirty()
        })
    }

    /// Writes the derived CABC mode to sysfs if it changed.
    pub fn apply_pending_cabc(&self) -> Result<()> {
        if !self.shared.caps.cabc {
            return Ok(());
        }

        let mode = {
            let mut st = self.shared.lock();
            if !st.cabc.is_dirty() {
                return Ok(());
            }
            st.cabc.clear_dirty();
            st.cabc.get()
        };

        let res = self.shared.nodes.cabc_mode.write_value(mode);
        if res.is_err() {
            self.shared.lock().cabc.set_dirty();
        }
        res
    }

    pub fn set_ignore_brightness_update_requests(&self, ignore: bool) {
        info!("ignore brightness update requests: {ignore}");
        self.shared.lock().ignore_updates = ignore;
    }

    /// Queues the pending brightness state on this frame's commit.
    ///
    /// Must be called once per frame by the commit path; dirty state is consumed here.
    pub fn prepare_frame_commit(
        &self,
        connector_id: u32,
        props: &ConnectorProps,
        req: &mut AtomicReq<'_>,
        mixed_composition: bool,
        color: Option<&dyn DisplayColorCapable>,
    ) -> Result<FrameSyncFlags> {
        let _span = tracy_client::span!("BrightnessController::prepare_frame_commit");
        let shared = &*self.shared;
        let mut st = shared.lock();
        let mut sync = FrameSyncFlags::default();

        let mixed_sync =
            mixed_composition && shared.is_mixed_sync_jump(st.committed_nits, st.brightness_nits);
        if mixed_sync != st.mixed_sync {
            st.mixed_sync = mixed_sync;
            shared.update_dimming_locked(&mut st);
        }
        if mixed_sync {
            st.brightness_level.set_dirty();
            sync.backlight = true;
        }

        if st.dimming.is_dirty() {
            req.add_property(connector_id, &props.dimming_on, u64::from(st.dimming.get()), true)?;
            st.dimming.clear_dirty();
        }

        if st.lhbm.is_dirty() && shared.caps.lhbm {
            let on = st.lhbm.get();
            req.add_property(connector_id, &props.lhbm_on, u64::from(on), false)?;
            sync.lhbm = true;
            st.unchecked_lhbm_status = Some(on);

            if on {
                let level = st.brightness_level.get();
                let adjusted = color.and_then(|color| color.lhbm_adjusted_brightness_level(level));
                let normal = shared
                    .table
                    .as_ref()
                    .map(|table| *table.range(BrightnessRange::Normal));

                if let (Some(adjusted), Some(normal)) = (adjusted, normal) {
                    if adjusted != level && normal.contains_level(adjusted) {
                        debug!("local HBM adjusts brightness level {level} -> {adjusted}");
                        req.add_property(
                            connector_id,
                            &props.brightness_level,
                            u64::from(adjusted),
                            false,
                        )?;
                        st.lhbm_brightness_adjusted = true;
                        st.brightness_level.clear_dirty();
                        sync.backlight = true;
                    }
                }
            } else if st.lhbm_brightness_adjusted {
                st.lhbm_brightness_adjusted = false;
                st.brightness_level.set_dirty();
            }

            st.lhbm.clear_dirty();
        }

        let mut level_queued = false;
        if st.brightness_level.is_dirty() {
            req.add_property(
                connector_id,
                &props.brightness_level,
                u64::from(st.brightness_level.get()),
                false,
            )?;
            st.brightness_level.clear_dirty();
            level_queued = true;
        }

        if st.ghbm.is_dirty() && shared.caps.ghbm {
            let mode = st.ghbm.get();
            let value = props.hbm_modes.get(mode as u64)?;
            req.add_property(connector_id, &props.hbm_mode, value, false)?;
            sync.ghbm = true;
            sync.backlight |= level_queued;
            st.unchecked_ghbm_status = Some(mode);
            st.ghbm.clear_dirty();
        }

        st.committed_nits = st.brightness_nits;
        st.last_frame_mixed = mixed_composition;
        Ok(sync)
    }

    /// Forgets all panel state; called when the display is powered off.
    pub fn on_clear_display(&self) {
        if let Some(timer) = &self.dimming_timer {
            timer.cancel();
        }
        let mut st = self.shared.lock();
        self.shared.reset_locked(&mut st);
    }

    pub fn set_power_mode(&self, mode: PowerMode) {
        {
            let mut st = self.shared.lock();
            st.power_on = mode.is_on();
        }
        self.shared.changed.notify_all();

        if !mode.is_on() {
            self.on_clear_display();
        }
    }

    /// Updated by the interface whenever the observed refresh rate changes.
    pub fn set_peak_refresh_active(&self, active: bool) {
        self.shared.lock().peak_refresh = active;
        self.shared.changed.notify_all();
    }

    /// Turns local HBM on or off and blocks until the panel reports the new state.
    ///
    /// Waits for the display to be powered on and, when enabling, for the peak refresh rate.
    pub fn set_lhbm_state(&self, enabled: bool) -> Result<()> {
        let _span = tracy_client::span!("BrightnessController::set_lhbm_state");
        let shared = &*self.shared;
        if !shared.caps.lhbm {
            return Err(HwcError::Unsupported("local HBM"));
        }

        {
            let st = shared.lock();
            let (st, res) = shared
                .changed
                .wait_timeout_while(st, shared.panel.lhbm_power_on_timeout(), |st| !st.power_on)
                .unwrap_or_else(PoisonError::into_inner);
            if res.timed_out() {
                warn!("display not powered on, cannot set local HBM {enabled}");
                return Err(HwcError::TimedOut("display power on"));
            }

            if enabled {
                let (_st, res) = shared
                    .changed
                    .wait_timeout_while(st, shared.panel.lhbm_peak_refresh_timeout(), |st| {
                        !st.peak_refresh
                    })
                    .unwrap_or_else(PoisonError::into_inner);
                if res.timed_out() {
                    warn!("peak refresh rate not reached, enabling local HBM anyway");
                }
            }
        }

        self.process_local_hbm(enabled)?;

        let expected = if enabled { "1" } else { "0" };
        check_sysfs_status(
            shared.nodes.local_hbm_mode.path(),
            &[expected],
            shared.panel.lhbm_status_timeout(),
        )
    }

    pub fn is_ghbm_on(&self) -> bool {
        self.shared.lock().ghbm.get() != HbmMode::Off
    }

    pub fn ghbm_mode(&self) -> HbmMode {
        self.shared.lock().ghbm.get()
    }

    pub fn is_lhbm_on(&self) -> bool {
        self.shared.lock().lhbm.get()
    }

    pub fn is_dimming_on(&self) -> bool {
        self.shared.lock().dimming.get()
    }

    pub fn brightness_level(&self) -> u32 {
        self.shared.lock().brightness_level.get()
    }

    pub fn brightness_nits(&self) -> f32 {
        self.shared.lock().brightness_nits
    }

    pub fn cabc_mode(&self) -> CabcMode {
        self.shared.lock().cabc.get()
    }

    pub fn dump(&self) -> String {
        let shared = &*self.shared;
        let st = shared.lock();
        let mut out = String::new();

        let _ = writeln!(out, "BrightnessController (panel{}):", shared.panel.index);
        let _ = writeln!(out, "\tcaps: {:?}", shared.caps);
        let _ = writeln!(
            out,
            "\tdimming usage: {:?}, max brightness: {}",
            shared.panel.brightness_dimming_usage, shared.max_brightness
        );
        let _ = writeln!(
            out,
            "\trequests: brightness={} lhbm={} enhance_hbm={} instant_hbm={} dim={} cabc={:?}",
            st.brightness_float_req.get(),
            st.lhbm_req.get(),
            st.enhance_hbm_req.get(),
            st.instant_hbm_req.get(),
            st.dim_brightness_req.get(),
            st.cabc_req.get(),
        );
        let _ = writeln!(
            out,
            "\tstates: level={} nits={} ghbm={:?} lhbm={} dimming={} cabc={:?}",
            st.brightness_level.get(),
            st.brightness_nits,
            st.ghbm.get(),
            st.lhbm.get(),
            st.dimming.get(),
            st.cabc.get(),
        );
        let _ = writeln!(
            out,
            "\tpending checks: ghbm={:?} lhbm={:?}, ignore updates: {}",
            st.unchecked_ghbm_status, st.unchecked_lhbm_status, st.ignore_updates,
        );
        if let Some(table) = &shared.table {
            for range in [BrightnessRange::Normal, BrightnessRange::Hbm] {
                let _ = writeln!(out, "\t{range:?}: {:?}", table.range(range));
            }
        }
        out
    }
}
