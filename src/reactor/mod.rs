//! Display Reactor
//!
//! A single-threaded loop that interleaves protocol events with software
//! timers. Each iteration either dispatches one buffered protocol event, or
//! (when nothing is buffered) waits on the connection with a timeout taken
//! from the timer queue and then fires every due timer.
//!
//! The reactor knows nothing about X11 itself: the connection is an
//! [`EventSource`], event handling is an [`EventHandler`], and time comes from
//! a [`Clock`], so the ordering rules can be exercised without a server.

pub mod signals;
pub mod timer;

use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use crate::error::{FaultFlag, Result, WmError};
use signals::SignalMailbox;
pub use timer::{Timer, TimerId, TimerQueue};

/// Lifecycle of the reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Startup,
    Running,
    Shutdown,
}

/// Why `event_loop` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// An internal fault was recorded; shutdown ran
    Faulted,
    /// SIGINT or SIGTERM; exit cleanly
    Terminated(Signal),
    /// Any other unhandled signal; the caller should abort
    Abort(Signal),
    /// A protocol error arrived after an internal fault; abort immediately
    Unrecoverable,
}

/// Source of "now"
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Monotonic wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// The protocol connection as the reactor sees it
pub trait EventSource {
    type Event;

    /// Next buffered event, without blocking
    fn poll_pending(&mut self) -> Result<Option<Self::Event>>;

    /// Block until the connection is readable or `timeout` elapses
    ///
    /// `None` blocks indefinitely. Interruption by a signal counts as a
    /// normal wake.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<()>;
}

/// Receiver of protocol events and signals
pub trait EventHandler: Sized {
    type Event;

    /// Handle one protocol event
    fn dispatch(&mut self, event: Self::Event, timers: &mut TimerQueue<Self>) -> Result<()>;

    /// Handle a signal; return `false` to let the reactor apply its default
    /// policy
    fn handle_signal(&mut self, _signal: Signal, _timers: &mut TimerQueue<Self>) -> bool {
        false
    }

    /// Undo everything that must not outlive the process
    fn shutdown(&mut self, timers: &mut TimerQueue<Self>);
}

pub struct Reactor<S, C, H> {
    source: S,
    clock: C,
    timers: TimerQueue<H>,
    signals: SignalMailbox,
    fault: FaultFlag,
    state: RunState,
    /// One-shot guard against overlapping shutdown attempts
    shutdown_started: bool,
}

impl<S, C, H> Reactor<S, C, H>
where
    S: EventSource,
    C: Clock,
    H: EventHandler<Event = S::Event>,
{
    pub fn new(source: S, clock: C, signals: SignalMailbox, fault: FaultFlag) -> Self {
        Self {
            source,
            clock,
            timers: TimerQueue::new(),
            signals,
            fault,
            state: RunState::Startup,
            shutdown_started: false,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_startup(&self) -> bool {
        self.state == RunState::Startup
    }

    pub fn timers(&mut self) -> &mut TimerQueue<H> {
        &mut self.timers
    }

    /// Run until faulted or terminated by a signal
    ///
    /// The handler's `shutdown` runs exactly once before this returns, except
    /// for `LoopExit::Unrecoverable`, which skips it.
    pub fn event_loop(&mut self, handler: &mut H) -> LoopExit {
        self.state = RunState::Running;
        info!("Entering event loop");

        while self.state == RunState::Running && !self.fault.is_raised() {
            if let Some(signal) = self.signals.take() {
                if let Some(exit) = self.service_signal(signal, handler) {
                    return exit;
                }
                continue;
            }

            match self.source.poll_pending() {
                Ok(Some(event)) => {
                    if let Err(err) = handler.dispatch(event, &mut self.timers) {
                        if let Some(exit) = self.absorb(err) {
                            return exit;
                        }
                    }
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    if let Some(exit) = self.absorb(err) {
                        return exit;
                    }
                    continue;
                }
            }

            let timeout = self.timers.time_until_next(self.clock.now());
            if let Err(err) = self.source.wait(timeout) {
                if let Some(exit) = self.absorb(err) {
                    return exit;
                }
            }

            let now = self.clock.now();
            self.timers.drain_due(now, handler);
        }

        self.shutdown(handler);
        LoopExit::Faulted
    }

    /// Log an error; stop the loop if it threatens an invariant
    fn absorb(&mut self, err: WmError) -> Option<LoopExit> {
        if err.is_unrecoverable() {
            error!("{}", err);
            self.state = RunState::Shutdown;
            return Some(LoopExit::Unrecoverable);
        }
        if err.is_fatal() {
            error!("Fatal error, leaving event loop: {}", err);
            self.fault.raise();
        } else {
            warn!("Error handling event: {}", err);
        }
        None
    }

    fn service_signal(&mut self, signal: Signal, handler: &mut H) -> Option<LoopExit> {
        if signal == Signal::SIGCHLD {
            signals::reap_children();
            return None;
        }

        if handler.handle_signal(signal, &mut self.timers) {
            debug!("Signal {} handled", signal);
            return None;
        }

        error!("signal {} caught", signal);

        if !self.is_startup() && !self.shutdown_started {
            self.fault.raise();
            warn!("shutting down");
            self.shutdown(handler);
        }

        match signal {
            Signal::SIGTERM | Signal::SIGINT => Some(LoopExit::Terminated(signal)),
            _ => {
                error!("aborting... dumping core");
                Some(LoopExit::Abort(signal))
            }
        }
    }

    fn shutdown(&mut self, handler: &mut H) {
        if self.shutdown_started {
            return;
        }
        self.shutdown_started = true;
        self.state = RunState::Shutdown;
        info!("Shutting down");
        handler.shutdown(&mut self.timers);
    }
}
