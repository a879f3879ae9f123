//! Signal Module
//!
//! Handlers only record the signal number in an atomic bitmask and write a
//! byte to a wakeup pipe. The reactor picks pending signals up at the top of
//! each iteration; nothing touches the window tree from inside a handler.
//! The pipe's read end is polled next to the display connection, so a signal
//! that lands between the mailbox check and the wait still wakes the loop.
//!
//! SIGSEGV and SIGFPE are the exception: their handler reports and re-raises
//! at once with the default action. Neither the event handler nor the
//! orderly shutdown pass runs for them.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use mio::unix::pipe;
use nix::errno::Errno;
use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{write, Pid};
use tracing::{debug, info, trace};

use crate::error::{Result, WmError};

/// Signals routed through the reactor
pub const ROUTED: [Signal; 7] = [
    Signal::SIGPIPE,
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// Signals after which execution cannot continue
///
/// Returning from their handler re-runs the faulting instruction, so they get
/// a report-and-reraise handler instead of the mailbox.
pub const FATAL: [Signal; 2] = [Signal::SIGSEGV, Signal::SIGFPE];

static PENDING: AtomicU64 = AtomicU64::new(0);

/// Write end of the wakeup pipe, kept open for the life of the process
static WAKE_TX: OnceLock<pipe::Sender> = OnceLock::new();
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn record_signal(signo: std::ffi::c_int) {
    if (0..64).contains(&signo) {
        PENDING.fetch_or(1 << signo, Ordering::SeqCst);
    }
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let saved = Errno::last_raw();
        // SAFETY: WAKE_TX owns this descriptor and is never dropped.
        let tx = unsafe { BorrowedFd::borrow_raw(fd) };
        // A full pipe already guarantees a wake.
        let _ = write(tx, &[1]);
        Errno::set_raw(saved);
    }
}

extern "C" fn fatal_signal(signo: std::ffi::c_int) {
    // SAFETY: fd 2 stays open for the life of the process.
    let stderr = unsafe { BorrowedFd::borrow_raw(2) };
    let _ = write(stderr, b"lintel: fatal signal caught, aborting... dumping core\n");
    if let Ok(signal) = Signal::try_from(signo) {
        // SA_RESETHAND restored the default action, so this dumps core.
        let _ = raise(signal);
    }
}

/// Pending-signal mailbox read by the reactor
#[derive(Debug, Clone, Default)]
pub struct SignalMailbox {
    /// `None` reads the process-wide handler mask
    local: Option<Arc<AtomicU64>>,
    /// Read end of the wakeup pipe the handlers write to
    wake: Option<Arc<pipe::Receiver>>,
}

impl SignalMailbox {
    /// Install process handlers and return the mailbox they feed
    ///
    /// Only one mailbox per process may be installed.
    pub fn install() -> Result<Self> {
        let (tx, rx) = pipe::new()?;
        let fd = tx.as_raw_fd();
        WAKE_TX
            .set(tx)
            .map_err(|_| WmError::Invariant("signal handlers installed twice".into()))?;
        WAKE_FD.store(fd, Ordering::SeqCst);

        let routed = SigAction::new(
            SigHandler::Handler(record_signal),
            SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        for signal in ROUTED {
            // SAFETY: the handler performs an atomic store and write(2).
            unsafe { sigaction(signal, &routed) }.map_err(std::io::Error::from)?;
            trace!("Installed handler for {}", signal);
        }

        let fatal = SigAction::new(
            SigHandler::Handler(fatal_signal),
            SaFlags::SA_RESETHAND | SaFlags::SA_NODEFER,
            SigSet::empty(),
        );
        for signal in FATAL {
            // SAFETY: the handler calls only write(2) and raise(3).
            unsafe { sigaction(signal, &fatal) }.map_err(std::io::Error::from)?;
        }

        debug!("Signal handlers installed");
        Ok(Self {
            local: None,
            wake: Some(Arc::new(rx)),
        })
    }

    /// A mailbox not connected to any process handler
    pub fn detached() -> Self {
        Self {
            local: Some(Arc::new(AtomicU64::new(0))),
            wake: None,
        }
    }

    /// Descriptor that turns readable when a signal arrives
    pub fn wake_fd(&self) -> Option<RawFd> {
        self.wake.as_deref().map(AsRawFd::as_raw_fd)
    }

    /// Empty the wakeup pipe
    ///
    /// Runs before the mask is read, so a byte written after this point
    /// belongs to a signal the next wait will see.
    fn drain_wake(&self) {
        let Some(rx) = self.wake.as_deref() else {
            return;
        };
        let mut buf = [0u8; 64];
        loop {
            match (&*rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Failed to drain the signal pipe: {}", e);
                    break;
                }
            }
        }
    }

    fn bits(&self) -> &AtomicU64 {
        self.local.as_deref().unwrap_or(&PENDING)
    }

    /// Queue a signal as if its handler had run
    pub fn post(&self, signal: Signal) {
        self.bits().fetch_or(1 << signal as i32, Ordering::SeqCst);
    }

    /// Take the pending signal with the lowest number
    pub fn take(&self) -> Option<Signal> {
        self.drain_wake();
        let bits = self.bits();
        loop {
            let pending = bits.load(Ordering::SeqCst);
            if pending == 0 {
                return None;
            }
            let signo = pending.trailing_zeros();
            let mask = 1u64 << signo;
            if bits.fetch_and(!mask, Ordering::SeqCst) & mask != 0 {
                return Signal::try_from(signo as i32).ok();
            }
        }
    }
}

/// Collect every exited child without blocking
pub fn reap_children() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                debug!("Reaped child: {:?}", status);
                reaped += 1;
            }
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                info!("waitpid failed: {}", err);
                break;
            }
        }
    }
    reaped
}
