//! Lazily opened, idle-closed session handle.
//!
//! [`SessionManager::acquire`] opens the handle on first use and lends it out
//! as a [`SessionLease`]. One timer thread per handle lifetime waits until the
//! handle has sat unused for the idle timeout and then closes it; further
//! acquisitions push that deadline back instead of starting another timer.
//!
//! Acquisition, lease release, idle expiry, and shutdown all run under one
//! mutex. The timer re-checks the last-use timestamp and the outstanding lease
//! count before closing, so it never closes a handle that is in use or was
//! just handed out.

use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Error;

/// A closeable connection to a remote service.
pub trait Session: Send + Sync + 'static {
    fn close(&self);

    /// Whether the session should be replaced before its next use.
    fn is_stale(&self) -> bool {
        false
    }
}

/// Opens new sessions on demand.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session;

    fn open(&self) -> Result<Self::Session, Error>;
}

/// Lifetime counters for a [`SessionManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub opened: usize,
    pub closed: usize,
    pub timers_started: usize,
    /// Acquisitions that pushed back a running timer instead of starting one.
    pub timer_resets: usize,
}

struct State<S> {
    handle: Option<Arc<S>>,
    leases: usize,
    last_used: Instant,
    timer: Option<JoinHandle<()>>,
    shut_down: bool,
    stats: SessionStats,
}

impl<S: Session> State<S> {
    fn close_handle(&mut self, reason: &str) {
        if let Some(handle) = self.handle.take() {
            handle.close();
            self.stats.closed += 1;
            debug!(reason, "session closed");
        }
    }
}

struct Shared<S> {
    state: Mutex<State<S>>,
    wake: Condvar,
    idle_timeout: Option<Duration>,
}

impl<S> Shared<S> {
    fn lock(&self) -> MutexGuard<'_, State<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns at most one session and closes it after a period of disuse.
pub struct SessionManager<F: SessionFactory> {
    factory: F,
    shared: Arc<Shared<F::Session>>,
}

impl<F: SessionFactory> SessionManager<F> {
    pub fn new(factory: F, idle_timeout: Duration) -> Self {
        Self::build(factory, Some(idle_timeout))
    }

    /// A manager whose session stays open until [`shutdown`](Self::shutdown).
    ///
    /// No idle timer is ever started.
    pub fn without_idle_timeout(factory: F) -> Self {
        Self::build(factory, None)
    }

    fn build(factory: F, idle_timeout: Option<Duration>) -> Self {
        Self {
            factory,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    handle: None,
                    leases: 0,
                    last_used: Instant::now(),
                    timer: None,
                    shut_down: false,
                    stats: SessionStats::default(),
                }),
                wake: Condvar::new(),
                idle_timeout,
            }),
        }
    }

    /// Borrow the live session, opening one if needed, and restart the idle
    /// countdown.
    ///
    /// The countdown only runs while no lease is outstanding.
    pub fn acquire(&self) -> Result<SessionLease<F::Session>, Error> {
        let mut state = self.shared.lock();
        if state.shut_down {
            return Err(Error::ShutDown);
        }

        if state.leases == 0 && state.handle.as_ref().is_some_and(|h| h.is_stale()) {
            state.close_handle("stale");
        }
        let handle = match &state.handle {
            Some(handle) => Arc::clone(handle),
            None => {
                let handle = Arc::new(self.factory.open()?);
                state.stats.opened += 1;
                state.handle = Some(Arc::clone(&handle));
                handle
            }
        };

        if state.timer.is_some() {
            state.stats.timer_resets += 1;
        } else if let Some(idle_timeout) = self.shared.idle_timeout {
            let shared = Arc::clone(&self.shared);
            let timer = thread::Builder::new()
                .name("session-idle".to_string())
                .spawn(move || run_idle_timer(shared, idle_timeout))?;
            state.timer = Some(timer);
            state.stats.timers_started += 1;
        }

        state.leases += 1;
        state.last_used = Instant::now();
        drop(state);
        self.shared.wake.notify_all();

        Ok(SessionLease {
            handle,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Stop the idle timer, wait for it, and close the session.
    ///
    /// Safe to call more than once. Later `acquire` calls fail.
    pub fn shutdown(&self) {
        let timer = {
            let mut state = self.shared.lock();
            state.shut_down = true;
            state.timer.take()
        };
        self.shared.wake.notify_all();
        if let Some(timer) = timer
            && timer.join().is_err()
        {
            warn!("idle timer thread panicked");
        }
        self.shared.lock().close_handle("shutdown");
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().handle.is_some()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.lock().stats
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.shared.idle_timeout
    }
}

impl<F: SessionFactory> Drop for SessionManager<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_idle_timer<S: Session>(shared: Arc<Shared<S>>, idle_timeout: Duration) {
    let mut state = shared.lock();
    loop {
        if state.shut_down || state.handle.is_none() {
            break;
        }
        if state.leases > 0 {
            state = shared
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        }
        let idle = state.last_used.elapsed();
        if idle >= idle_timeout {
            state.close_handle("idle");
            break;
        }
        let (guard, _) = shared
            .wake
            .wait_timeout(state, idle_timeout - idle)
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;
    }
    // shutdown() may already have taken our handle to join it.
    state.timer = None;
}

/// A borrowed session. Dropping it starts the idle countdown.
pub struct SessionLease<S: Session> {
    handle: Arc<S>,
    shared: Arc<Shared<S>>,
}

impl<S: Session> Deref for SessionLease<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.handle
    }
}

impl<S: Session> Drop for SessionLease<S> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.leases = state.leases.saturating_sub(1);
        state.last_used = Instant::now();
        drop(state);
        self.shared.wake.notify_all();
    }
}
