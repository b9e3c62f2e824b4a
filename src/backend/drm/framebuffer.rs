//! Per-layer cache of DRM framebuffer objects.
//!
//! Framebuffers that are no longer needed move to a clean list. A reclaim thread removes
//! them from the kernel once the next flip has happened, so `RmFB` never blocks the commit
//! path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use std::os::fd::AsFd;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use hwc_config::FramebufferLimits;
use tracing::{debug, trace, warn};

use super::device::{FramebufferSpec, KmsDevice};
use super::format::{
    buffer_framebuffer_spec, format_desc, solid_color_framebuffer_spec, validate_framebuffer_spec,
};
use super::types::{BufferInfo, FbOwner, WinConfig, WinConfigState};
use crate::error::{HwcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FbDesc {
    Buffer {
        buffer_id: u64,
        drm_format: u32,
        protected: bool,
    },
    SolidColor {
        width: u32,
        height: u32,
    },
}

impl FbDesc {
    fn is_protected(&self) -> bool {
        matches!(self, Self::Buffer { protected: true, .. })
    }
}

/// A kernel framebuffer object, removed on drop.
struct Framebuffer {
    device: Arc<dyn KmsDevice>,
    fb_id: u32,
    desc: FbDesc,
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        trace!("removing framebuffer {} ({:?})", self.fb_id, self.desc);
        if let Err(err) = self.device.remove_framebuffer(self.fb_id) {
            warn!("error removing framebuffer {}: {err}", self.fb_id);
        }
    }
}

#[derive(Default)]
struct State {
    /// Most recently used first.
    cached: HashMap<FbOwner, VecDeque<Framebuffer>>,
    /// Released, but possibly still on screen until the next flip.
    clean: Vec<Framebuffer>,
    /// Flipped away from; the reclaim thread removes these.
    reclaim: Vec<Framebuffer>,
    shrink_pending: bool,
    in_use: HashSet<FbOwner>,
    has_secure_framebuffer: bool,
    quit: bool,
}

impl State {
    /// Moves the first protected client target framebuffer to the clean list.
    fn destroy_secure_framebuffer(&mut self) {
        let Some(list) = self.cached.get_mut(&FbOwner::ClientTarget) else {
            return;
        };
        if let Some(pos) = list.iter().position(|fb| fb.desc.is_protected()) {
            if let Some(fb) = list.remove(pos) {
                debug!("releasing secure framebuffer {}", fb.fb_id);
                self.clean.push(fb);
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    flipped: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reclaim_loop(&self) {
        loop {
            let mut st = self
                .flipped
                .wait_while(self.lock(), |st| st.reclaim.is_empty() && !st.quit)
                .unwrap_or_else(PoisonError::into_inner);

            let quit = st.quit;
            let clean = mem::take(&mut st.reclaim);
            drop(st);

            if !clean.is_empty() {
                let _span = tracy_client::span!("FramebufferManager::reclaim");
                trace!("reclaiming {} framebuffers", clean.len());
                drop(clean);
            }

            if quit {
                return;
            }
        }
    }
}

pub struct FramebufferManager {
    device: Arc<dyn KmsDevice>,
    limits: FramebufferLimits,
    shared: Arc<Shared>,
    reclaim_thread: Option<JoinHandle<()>>,
}

impl FramebufferManager {
    pub fn new(device: Arc<dyn KmsDevice>, limits: FramebufferLimits) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            flipped: Condvar::new(),
        });

        let reclaim_thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(String::from("FramebufferReclaim"))
                .spawn(move || shared.reclaim_loop())
        };
        let reclaim_thread = match reclaim_thread {
            Ok(thread) => Some(thread),
            Err(err) => {
                // Without the thread, the clean list is drained on flip instead.
                warn!("error spawning framebuffer reclaim thread: {err}");
                None
            }
        };

        Self {
            device,
            limits,
            shared,
            reclaim_thread,
        }
    }

    /// Returns a framebuffer id for the config's buffer or solid colour, creating and caching
    /// one on a miss.
    pub fn get_buffer(&self, config: &WinConfig) -> Result<u32> {
        let _span = tracy_client::span!("FramebufferManager::get_buffer");

        let (desc, cap) = match &config.state {
            WinConfigState::Disabled => {
                return Err(HwcError::BadValue(String::from(
                    "disabled window config has no framebuffer",
                )))
            }
            WinConfigState::Color(_) => (
                FbDesc::SolidColor {
                    width: config.dst.w,
                    height: config.dst.h,
                },
                self.limits.max_cached_buffers_per_layer,
            ),
            WinConfigState::Buffer(buffer) => {
                let format = format_desc(buffer.format)?;
                let cap = if buffer.protected && config.composed_by_g2d {
                    self.limits.max_cached_secure_buffers_per_g2d_layer
                } else {
                    self.limits.max_cached_buffers_per_layer
                };
                let desc = FbDesc::Buffer {
                    buffer_id: buffer.id,
                    drm_format: format.drm as u32,
                    protected: buffer.protected,
                };
                (desc, cap)
            }
        };
        let owner = config.owner;

        {
            let mut st = self.shared.lock();
            if st.shrink_pending {
                st.in_use.insert(owner);
            }

            if let Some(list) = st.cached.get_mut(&owner) {
                if let Some(pos) = list.iter().position(|fb| fb.desc == desc) {
                    if pos != 0 {
                        if let Some(fb) = list.remove(pos) {
                            list.push_front(fb);
                        }
                    }
                    if let Some(fb) = list.front() {
                        return Ok(fb.fb_id);
                    }
                }
            }
        }

        let fb = match &config.state {
            WinConfigState::Buffer(buffer) => self.create_buffer_framebuffer(buffer, desc)?,
            _ => self.create_solid_color_framebuffer(config, desc)?,
        };
        let fb_id = fb.fb_id;
        debug!("new framebuffer {fb_id} for {owner:?}: {desc:?}");

        let mut st = self.shared.lock();
        let list = st.cached.entry(owner).or_default();
        list.push_front(fb);
        let evicted: Vec<_> = if list.len() > cap {
            list.drain(cap..).collect()
        } else {
            Vec::new()
        };
        st.clean.extend(evicted);

        if owner == FbOwner::ClientTarget && desc.is_protected() {
            st.has_secure_framebuffer = true;
        }

        Ok(fb_id)
    }

    fn add_framebuffer(&self, spec: &FramebufferSpec, desc: FbDesc) -> Result<Framebuffer> {
        validate_framebuffer_spec(spec)?;
        let fb_id = self
            .device
            .add_framebuffer(spec)
            .map_err(|err| HwcError::drm("AddFB2", err))?;

        Ok(Framebuffer {
            device: self.device.clone(),
            fb_id,
            desc,
        })
    }

    fn create_buffer_framebuffer(&self, buffer: &BufferInfo, desc: FbDesc) -> Result<Framebuffer> {
        let format = format_desc(buffer.format)?;
        if buffer.fds.len() < format.buffers {
            return Err(HwcError::BadValue(format!(
                "{:?} needs {} buffers, got {}",
                format.drm,
                format.buffers,
                buffer.fds.len()
            )));
        }

        let mut handles = Vec::with_capacity(format.buffers);
        let mut res = Ok(());
        for fd in &buffer.fds[..format.buffers] {
            match self.device.import_prime_fd(fd.as_fd()) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    res = Err(HwcError::drm("PRIME_FD_TO_HANDLE", err));
                    break;
                }
            }
        }

        let fb = res.and_then(|()| {
            let spec = buffer_framebuffer_spec(
                format,
                buffer.width,
                buffer.height,
                buffer.stride,
                &handles,
                buffer.compression,
                buffer.protected,
            );
            self.add_framebuffer(&spec, desc)
        });

        // The framebuffer holds its own references; the handles are not needed past AddFB2.
        handles.sort_unstable();
        handles.dedup();
        for handle in handles {
            if let Err(err) = self.device.close_gem_handle(handle) {
                warn!("error closing GEM handle {handle}: {err}");
            }
        }

        fb
    }

    fn create_solid_color_framebuffer(&self, config: &WinConfig, desc: FbDesc) -> Result<Framebuffer> {
        let spec = solid_color_framebuffer_spec(config.dst.w, config.dst.h);
        self.add_framebuffer(&spec, desc)
    }

    /// Starts a frame; if too many layers are cached, layers not used in this frame are
    /// released at the next flip.
    pub fn check_shrink(&self) {
        let mut st = self.shared.lock();
        if st.cached.len() > self.limits.max_cached_layers {
            trace!("{} cached layers, shrinking at flip", st.cached.len());
            st.shrink_pending = true;
        }
    }

    /// Called after a successful commit; hands released framebuffers to the reclaim thread.
    pub fn flip(&self, has_secure_frame: bool) {
        let _span = tracy_client::span!("FramebufferManager::flip");
        let mut st = self.shared.lock();

        if st.shrink_pending {
            let in_use = mem::take(&mut st.in_use);
            let unused: Vec<FbOwner> = st
                .cached
                .keys()
                .filter(|owner| !in_use.contains(owner))
                .copied()
                .collect();
            for owner in unused {
                if let Some(list) = st.cached.remove(&owner) {
                    st.clean.extend(list);
                }
            }
            st.shrink_pending = false;
        }

        if st.has_secure_framebuffer && !has_secure_frame {
            st.destroy_secure_framebuffer();
            st.has_secure_framebuffer = false;
        }

        self.wake_reclaim(st);
    }

    fn wake_reclaim(&self, mut st: MutexGuard<'_, State>) {
        if st.clean.is_empty() {
            return;
        }

        if self.reclaim_thread.is_some() {
            let clean = mem::take(&mut st.clean);
            st.reclaim.extend(clean);
            drop(st);
            self.shared.flipped.notify_one();
        } else {
            let clean = mem::take(&mut st.clean);
            drop(st);
            drop(clean);
        }
    }

    /// Releases everything cached for an owner that went away.
    ///
    /// The framebuffers may still be on screen, so they are removed after the next flip.
    pub fn cleanup(&self, owner: FbOwner) {
        let mut st = self.shared.lock();
        st.in_use.remove(&owner);
        if let Some(list) = st.cached.remove(&owner) {
            trace!("releasing {} framebuffers of {owner:?} at flip", list.len());
            st.clean.extend(list);
        }
    }

    /// Releases the framebuffers of specific buffers of one owner at the next flip.
    pub fn uncache_layer_buffers(&self, owner: FbOwner, buffer_ids: &[u64]) {
        let mut st = self.shared.lock();
        let Some(list) = st.cached.get_mut(&owner) else {
            return;
        };

        let mut released = Vec::new();
        let mut i = 0;
        while i < list.len() {
            let matches = matches!(
                list[i].desc,
                FbDesc::Buffer { buffer_id, .. } if buffer_ids.contains(&buffer_id)
            );
            if matches {
                if let Some(fb) = list.remove(i) {
                    released.push(fb);
                }
            } else {
                i += 1;
            }
        }
        if list.is_empty() {
            st.cached.remove(&owner);
        }

        st.clean.extend(released);
    }

    /// Removes every protected framebuffer right away.
    pub fn destroy_all_secure_buffers(&self) {
        let mut released = Vec::new();
        {
            let mut st = self.shared.lock();
            for list in st.cached.values_mut() {
                let mut i = 0;
                while i < list.len() {
                    if list[i].desc.is_protected() {
                        released.extend(list.remove(i));
                    } else {
                        i += 1;
                    }
                }
            }
            st.cached.retain(|_, list| !list.is_empty());
            st.has_secure_framebuffer = false;
        }

        debug!("destroying {} secure framebuffers", released.len());
        drop(released);
    }

    /// Removes every cached framebuffer right away.
    pub fn release_all(&self) {
        let released: Vec<Framebuffer> = {
            let mut st = self.shared.lock();
            st.in_use.clear();
            st.shrink_pending = false;
            st.has_secure_framebuffer = false;
            let mut released = mem::take(&mut st.clean);
            released.append(&mut st.reclaim);
            for (_, list) in st.cached.drain() {
                released.extend(list);
            }
            released
        };

        debug!("releasing all {} framebuffers", released.len());
        drop(released);
    }

    /// Framebuffer id for a readback target buffer.
    pub fn get_writeback_buffer(&self, buffer: &BufferInfo) -> Result<u32> {
        let mut config = WinConfig::new(FbOwner::Writeback, 0, WinConfigState::Buffer(buffer.clone()));
        config.dst.w = buffer.width;
        config.dst.h = buffer.height;
        self.get_buffer(&config)
    }

    pub fn cached_layer_count(&self) -> usize {
        self.shared.lock().cached.len()
    }

    pub fn cached_buffer_count(&self, owner: FbOwner) -> usize {
        self.shared.lock().cached.get(&owner).map_or(0, VecDeque::len)
    }
}

impl Drop for FramebufferManager {
    fn drop(&mut self) {
        self.shared.lock().quit = true;
        self.shared.flipped.notify_one();
        if let Some(thread) = self.reclaim_thread.take() {
            if thread.join().is_err() {
                warn!("framebuffer reclaim thread panicked");
            }
        }
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::drm::format::{
        Compression, HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SP_M, HAL_PIXEL_FORMAT_RGBA_8888,
    };
    use crate::backend::drm::testing::{dummy_fd, FakeKms};
    use crate::backend::drm::types::{LayerId, Rect};

    fn setup() -> (Arc<FakeKms>, FramebufferManager) {
        setup_with(FramebufferLimits::default())
    }

    fn setup_with(limits: FramebufferLimits) -> (Arc<FakeKms>, FramebufferManager) {
        let kms = Arc::new(FakeKms::with_display());
        let manager = FramebufferManager::new(kms.clone(), limits);
        (kms, manager)
    }

    fn buffer(id: u64, protected: bool) -> BufferInfo {
        BufferInfo {
            id,
            fds: vec![Arc::new(dummy_fd())],
            width: 1080,
            height: 2400,
            stride: 1088,
            format: HAL_PIXEL_FORMAT_RGBA_8888,
            compression: Compression::None,
            protected,
        }
    }

    fn layer(layer: u64, buffer: BufferInfo) -> WinConfig {
        let mut config = WinConfig::new(
            FbOwner::Layer(LayerId(layer)),
            0,
            WinConfigState::Buffer(buffer),
        );
        config.dst = Rect::new(0, 0, 1080, 2400);
        config
    }

    fn client_target(buffer: BufferInfo) -> WinConfig {
        let mut config = WinConfig::new(FbOwner::ClientTarget, 0, WinConfigState::Buffer(buffer));
        config.dst = Rect::new(0, 0, 1080, 2400);
        config
    }

    #[test]
    fn cache_hit_issues_no_calls() {
        let (kms, manager) = setup();
        let config = layer(1, buffer(7, false));

        let first = manager.get_buffer(&config).unwrap();
        let second = manager.get_buffer(&config).unwrap();
        assert_eq!(first, second);
        assert_eq!(kms.import_count(), 1);
        assert_eq!(kms.added_framebuffers(), vec![first]);
        assert_eq!(kms.closed_handles().len(), 1);
    }

    #[test]
    fn same_buffer_on_other_layer_is_a_new_framebuffer() {
        let (kms, manager) = setup();
        let a = manager.get_buffer(&layer(1, buffer(7, false))).unwrap();
        let b = manager.get_buffer(&layer(2, buffer(7, false))).unwrap();
        assert_ne!(a, b);
        assert_eq!(kms.added_framebuffers().len(), 2);
    }

    #[test]
    fn multi_fd_format_imports_each_buffer() {
        let (kms, manager) = setup();
        let mut nv12 = buffer(3, false);
        nv12.format = HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SP_M;
        nv12.fds.push(Arc::new(dummy_fd()));

        let fb = manager.get_buffer(&layer(1, nv12)).unwrap();
        assert_eq!(kms.import_count(), 2);
        let spec = kms.framebuffer_spec(fb).unwrap();
        assert_ne!(spec.handles[0], spec.handles[1]);
    }

    #[test]
    fn missing_fds_are_rejected() {
        let (kms, manager) = setup();
        let mut nv12 = buffer(3, false);
        nv12.format = HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SP_M;

        let err = manager.get_buffer(&layer(1, nv12)).unwrap_err();
        assert!(matches!(err, HwcError::BadValue(_)));
        assert_eq!(kms.import_count(), 0);
    }

    #[test]
    fn add_framebuffer_failure_closes_handles() {
        let (kms, manager) = setup();
        kms.fail_next_add_framebuffer(libc::ENOMEM);

        let err = manager.get_buffer(&layer(1, buffer(7, false))).unwrap_err();
        assert!(matches!(err, HwcError::NoMemory));
        assert_eq!(kms.closed_handles().len(), 1);
        assert_eq!(manager.cached_layer_count(), 0);
    }

    #[test]
    fn solid_color_is_cached_by_size() {
        let (kms, manager) = setup();
        let mut config = WinConfig::new(
            FbOwner::Layer(LayerId(5)),
            0,
            WinConfigState::Color(0xff00_ff00),
        );
        config.dst = Rect::new(10, 10, 100, 50);

        let a = manager.get_buffer(&config).unwrap();
        config.state = WinConfigState::Color(0xffff_0000);
        let b = manager.get_buffer(&config).unwrap();
        assert_eq!(a, b);
        assert_eq!(kms.import_count(), 0);

        config.dst.w = 200;
        let c = manager.get_buffer(&config).unwrap();
        assert_ne!(a, c);
        let spec = kms.framebuffer_spec(c).unwrap();
        assert_eq!((spec.width, spec.height), (200, 50));
    }

    #[test]
    fn per_layer_cap_evicts_oldest() {
        let limits = FramebufferLimits {
            max_cached_buffers_per_layer: 2,
            ..FramebufferLimits::default()
        };
        let (kms, manager) = setup_with(limits);

        let first = manager.get_buffer(&layer(1, buffer(1, false))).unwrap();
        manager.get_buffer(&layer(1, buffer(2, false))).unwrap();
        manager.get_buffer(&layer(1, buffer(3, false))).unwrap();
        assert_eq!(manager.cached_buffer_count(FbOwner::Layer(LayerId(1))), 2);

        manager.flip(false);
        assert_eq!(kms.wait_removed_framebuffers(1), vec![first]);
    }

    #[test]
    fn secure_g2d_layer_cap() {
        let (_kms, manager) = setup();
        for id in 0..6 {
            let mut config = layer(1, buffer(id, true));
            config.composed_by_g2d = true;
            manager.get_buffer(&config).unwrap();
        }
        assert_eq!(manager.cached_buffer_count(FbOwner::Layer(LayerId(1))), 3);
    }

    #[test]
    fn cleanup_releases_layer() {
        let (kms, manager) = setup();
        let config = layer(1, buffer(7, false));
        let fb = manager.get_buffer(&config).unwrap();

        manager.cleanup(FbOwner::Layer(LayerId(1)));
        // Still on screen until the next flip.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(kms.removed_framebuffers().is_empty());

        manager.flip(false);
        assert_eq!(kms.wait_removed_framebuffers(1), vec![fb]);

        let again = manager.get_buffer(&config).unwrap();
        assert_ne!(again, fb);
        assert_eq!(kms.import_count(), 2);
    }

    #[test]
    fn shrink_releases_layers_unused_this_frame() {
        let limits = FramebufferLimits {
            max_cached_layers: 2,
            ..FramebufferLimits::default()
        };
        let (kms, manager) = setup_with(limits);
        for id in 0..3 {
            manager.get_buffer(&layer(id, buffer(id, false))).unwrap();
        }

        manager.check_shrink();
        manager.get_buffer(&layer(0, buffer(0, false))).unwrap();
        manager.flip(false);

        assert_eq!(kms.wait_removed_framebuffers(2).len(), 2);
        assert_eq!(manager.cached_layer_count(), 1);
        assert_eq!(manager.cached_buffer_count(FbOwner::Layer(LayerId(0))), 1);
    }

    #[test]
    fn non_secure_frame_evicts_one_secure_framebuffer() {
        let (kms, manager) = setup();
        let secure_a = manager.get_buffer(&client_target(buffer(1, true))).unwrap();
        let secure_b = manager.get_buffer(&client_target(buffer(2, true))).unwrap();
        manager.get_buffer(&client_target(buffer(3, false))).unwrap();

        manager.flip(true);
        assert_eq!(manager.cached_buffer_count(FbOwner::ClientTarget), 3);

        manager.flip(false);
        let removed = kms.wait_removed_framebuffers(1);
        assert_eq!(removed.len(), 1);
        // Most recently used first: the newer secure buffer is found first.
        assert_eq!(removed[0], secure_b);
        assert_eq!(manager.cached_buffer_count(FbOwner::ClientTarget), 2);

        // The flag is cleared; the next non-secure frame leaves the cache alone.
        manager.flip(false);
        assert_eq!(manager.cached_buffer_count(FbOwner::ClientTarget), 2);
        assert!(!kms.removed_framebuffers().contains(&secure_a));
    }

    #[test]
    fn uncache_specific_buffers() {
        let (kms, manager) = setup();
        let a = manager.get_buffer(&layer(1, buffer(1, false))).unwrap();
        manager.get_buffer(&layer(1, buffer(2, false))).unwrap();

        manager.uncache_layer_buffers(FbOwner::Layer(LayerId(1)), &[1]);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(kms.removed_framebuffers().is_empty());

        manager.flip(false);
        assert_eq!(kms.wait_removed_framebuffers(1), vec![a]);
        assert_eq!(manager.cached_buffer_count(FbOwner::Layer(LayerId(1))), 1);
    }

    #[test]
    fn destroy_all_secure_buffers_is_synchronous() {
        let (kms, manager) = setup();
        let secure = manager.get_buffer(&layer(1, buffer(1, true))).unwrap();
        manager.get_buffer(&layer(2, buffer(2, false))).unwrap();

        manager.destroy_all_secure_buffers();
        assert_eq!(kms.removed_framebuffers(), vec![secure]);
        assert_eq!(manager.cached_layer_count(), 1);
    }

    #[test]
    fn release_all_and_drop() {
        let (kms, manager) = setup();
        manager.get_buffer(&layer(1, buffer(1, false))).unwrap();
        manager.get_buffer(&layer(2, buffer(2, false))).unwrap();

        manager.release_all();
        assert_eq!(kms.removed_framebuffers().len(), 2);
        assert_eq!(manager.cached_layer_count(), 0);

        manager.get_buffer(&layer(3, buffer(3, false))).unwrap();
        drop(manager);
        assert_eq!(kms.removed_framebuffers().len(), 3);
    }

    #[test]
    fn writeback_buffer_is_cached() {
        let (kms, manager) = setup();
        let target = buffer(9, false);
        let a = manager.get_writeback_buffer(&target).unwrap();
        let b = manager.get_writeback_buffer(&target).unwrap();
        assert_eq!(a, b);
        assert_eq!(kms.added_framebuffers(), vec![a]);
    }
}
