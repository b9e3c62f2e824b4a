//! Delayed "dimming off" task running on its own event loop thread.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use calloop::channel::{self, Sender};
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, LoopHandle, RegistrationToken};
use tracing::{trace, warn};

enum Msg {
    Schedule(Duration),
    Cancel,
    Quit,
}

struct LoopState {
    handle: LoopHandle<'static, LoopState>,
    pending: Option<RegistrationToken>,
    callback: Box<dyn FnMut() + Send>,
}

impl LoopState {
    fn cancel(&mut self) {
        if let Some(token) = self.pending.take() {
            self.handle.remove(token);
        }
    }

    fn schedule(&mut self, delay: Duration) {
        self.cancel();

        let timer = Timer::from_duration(delay);
        let res = self.handle.insert_source(timer, |_, _, state| {
            state.pending = None;
            (state.callback)();
            TimeoutAction::Drop
        });
        match res {
            Ok(token) => self.pending = Some(token),
            Err(err) => warn!("error scheduling dimming off: {}", err.error),
        }
    }
}

/// Runs a callback once a delay has passed; rescheduling replaces the pending run.
pub struct DimmingTimer {
    sender: Sender<Msg>,
    thread: Option<JoinHandle<()>>,
}

impl DimmingTimer {
    pub fn spawn(callback: impl FnMut() + Send + 'static) -> Self {
        let (sender, channel) = channel::channel();

        let thread = thread::Builder::new()
            .name(String::from("DimmingLooper"))
            .spawn(move || {
                let mut event_loop: EventLoop<'static, LoopState> = match EventLoop::try_new() {
                    Ok(event_loop) => event_loop,
                    Err(err) => {
                        warn!("error creating dimming event loop: {err}");
                        return;
                    }
                };
                let signal = event_loop.get_signal();

                let mut state = LoopState {
                    handle: event_loop.handle(),
                    pending: None,
                    callback: Box::new(callback),
                };

                let res = event_loop
                    .handle()
                    .insert_source(channel, move |event, _, state| match event {
                        channel::Event::Msg(Msg::Schedule(delay)) => {
                            trace!("dimming off in {delay:?}");
                            state.schedule(delay);
                        }
                        channel::Event::Msg(Msg::Cancel) => state.cancel(),
                        channel::Event::Msg(Msg::Quit) | channel::Event::Closed => signal.stop(),
                    });
                if let Err(err) = res {
                    warn!("error inserting dimming channel: {}", err.error);
                    return;
                }

                if let Err(err) = event_loop.run(None, &mut state, |_| ()) {
                    warn!("dimming event loop failed: {err}");
                }
            });

        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(err) => {
                warn!("error spawning dimming thread: {err}");
                None
            }
        };

        Self { sender, thread }
    }

    pub fn schedule(&self, delay: Duration) {
        if self.sender.send(Msg::Schedule(delay)).is_err() {
            warn!("dimming thread is gone");
        }
    }

    pub fn cancel(&self) {
        let _ = self.sender.send(Msg::Cancel);
    }
}

impl Drop for DimmingTimer {
    fn drop(&mut self) {
        let _ = self.sender.send(Msg::Quit);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("dimming thread panicked");
            }
        }
    }
}
