//! Hardware vsync delivery and vsync-period verification.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::device::KmsDevice;

/// Whether an observed vsync period is within 20% of the desired one.
pub fn period_matches(observed_ns: u64, desired_ns: u64) -> bool {
    observed_ns.abs_diff(desired_ns) < desired_ns / 5
}

/// Follows the observed vsync period and tells when a requested config is on screen.
#[derive(Debug, Default)]
pub struct VsyncTracker {
    last_timestamp: Option<Duration>,
    period_ns: u64,
    desired: Option<(u32, u64)>,
}

impl VsyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts waiting for `config_id` with its vsync period.
    pub fn set_desired(&mut self, config_id: u32, period_ns: u64) {
        trace!("waiting for config {config_id} with period {period_ns}ns");
        self.desired = Some((config_id, period_ns));
    }

    pub fn has_pending_config(&self) -> bool {
        self.desired.is_some()
    }

    /// Last observed period, 0 until two vsyncs were seen.
    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    /// Forgets the last timestamp, e.g. after vsync was off for a while.
    pub fn reset_timestamps(&mut self) {
        self.last_timestamp = None;
    }

    /// Records one vsync. Returns the pending config id once its period is observed.
    pub fn on_vsync(&mut self, timestamp: Duration) -> Option<u32> {
        let last = self.last_timestamp.replace(timestamp)?;
        let period = timestamp.saturating_sub(last);
        self.period_ns = u64::try_from(period.as_nanos()).unwrap_or(u64::MAX);

        let (config_id, desired_ns) = self.desired?;
        if period_matches(self.period_ns, desired_ns) {
            debug!(
                "config {config_id} applied, observed period {}ns",
                self.period_ns
            );
            self.desired = None;
            Some(config_id)
        } else {
            trace!(
                "period {}ns does not match {desired_ns}ns yet",
                self.period_ns
            );
            None
        }
    }
}

#[derive(Debug, Default)]
struct WorkerState {
    enabled: bool,
    /// Bumped by every enable, so a handler that saw stale state does not turn vsync off.
    generation: u64,
    quit: bool,
}

struct Shared {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A thread waiting for vblanks of one CRTC while enabled.
pub struct VsyncWorker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl VsyncWorker {
    /// `handler` runs on the worker thread for each vblank; returning `false` disables the
    /// worker.
    pub fn spawn(
        device: Arc<dyn KmsDevice>,
        pipe: u32,
        mut handler: impl FnMut(Duration) -> bool + Send + 'static,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkerState::default()),
            cond: Condvar::new(),
        });

        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("VsyncWorker{pipe}"))
                .spawn(move || loop {
                    let generation = {
                        let st = shared
                            .cond
                            .wait_while(shared.lock(), |st| !st.enabled && !st.quit)
                            .unwrap_or_else(PoisonError::into_inner);
                        if st.quit {
                            return;
                        }
                        st.generation
                    };

                    match device.wait_vblank(pipe) {
                        Ok(timestamp) => {
                            if !handler(timestamp) {
                                let mut st = shared.lock();
                                if st.generation == generation {
                                    st.enabled = false;
                                }
                            }
                        }
                        Err(err) => {
                            warn!("error waiting for vblank on pipe {pipe}: {err}");
                            thread::sleep(Duration::from_millis(16));
                        }
                    }
                })
        };
        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(err) => {
                warn!("error spawning vsync thread: {err}");
                None
            }
        };

        Self { shared, thread }
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut st = self.shared.lock();
        if enabled {
            st.generation += 1;
        }
        if st.enabled != enabled {
            trace!("hardware vsync {}", if enabled { "on" } else { "off" });
            st.enabled = enabled;
            drop(st);
            self.shared.cond.notify_all();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }
}

impl Drop for VsyncWorker {
    fn drop(&mut self) {
        self.shared.lock().quit = true;
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("vsync thread panicked");
            }
        }
    }
}
