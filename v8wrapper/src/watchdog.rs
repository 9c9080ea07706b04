//! Wall-clock limits for script execution.
//!
//! A [Watchdog] owns a helper thread that terminates execution in one isolate when an armed
//! deadline passes. Only one deadline is armed at a time, which matches the single-threaded use of
//! an isolate.

use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};

pub struct Watchdog {
    shared: Arc<Shared>,
    // Kept so that `Drop` can wait for the thread to observe the shutdown request.
    thread_join: Option<std::thread::JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    handle: v8::IsolateHandle,
}

#[derive(Default)]
struct State {
    generation: u64,
    deadline: Option<Instant>,
    fired: bool,
    shutdown: bool,
}

impl Watchdog {
    /// Starts a watchdog thread that terminates execution through `handle`.
    pub fn new(handle: v8::IsolateHandle) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            handle,
        });

        let thread_shared = shared.clone();
        let thread_join = std::thread::Builder::new()
            .name("v8-watchdog".into())
            .spawn(move || thread_shared.run())
            .context("spawning watchdog thread")?;

        Ok(Self {
            shared,
            thread_join: Some(thread_join),
        })
    }

    /// Arms the watchdog to terminate execution once `timeout` has elapsed. The returned guard
    /// disarms it.
    pub fn arm(&self, timeout: Duration) -> WatchGuard<'_> {
        let mut state = self.shared.lock();
        state.generation = state.generation.wrapping_add(1);
        state.deadline = Some(Instant::now() + timeout);
        state.fired = false;
        let generation = state.generation;
        drop(state);
        self.shared.wake.notify_all();

        WatchGuard {
            watchdog: self,
            generation,
            disarmed: false,
        }
    }

    fn disarm(&self, generation: u64) -> bool {
        let mut state = self.shared.lock();
        if state.generation != generation {
            return false;
        }
        let fired = state.fired;
        state.deadline = None;
        state.fired = false;
        drop(state);
        self.shared.wake.notify_all();

        // A termination that was requested after the script returned must not leak into the next
        // script run on this isolate.
        self.shared.handle.cancel_terminate_execution();
        fired
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(thread_join) = self.thread_join.take() {
            if thread_join.join().is_err() {
                log::warn!("Watchdog thread panicked.");
            }
        }
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("failed to lock watchdog state")
    }

    fn run(&self) {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.deadline {
                None => {
                    state = self
                        .wake
                        .wait(state)
                        .expect("failed to wait on watchdog state");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.handle.terminate_execution();
                        state.fired = true;
                        state.deadline = None;
                    } else {
                        state = self
                            .wake
                            .wait_timeout(state, deadline - now)
                            .expect("failed to wait on watchdog state")
                            .0;
                    }
                }
            }
        }
    }
}

/// Disarms its [Watchdog] when dropped or when [WatchGuard::disarm] is called.
pub struct WatchGuard<'a> {
    watchdog: &'a Watchdog,
    generation: u64,
    disarmed: bool,
}

impl WatchGuard<'_> {
    /// Disarms the watchdog, returning true if the deadline passed and execution was terminated.
    pub fn disarm(mut self) -> bool {
        self.disarmed = true;
        self.watchdog.disarm(self.generation)
    }
}

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        if !self.disarmed {
            self.watchdog.disarm(self.generation);
        }
    }
}
