//! Error types and protocol error reporting
//!
//! `WmError` covers everything the reactor and the window manager can fail
//! with. `ProtocolErrors` is the callback every X11 error event goes through;
//! it shares a `FaultFlag` with the reactor so that an internal fault stops
//! the loop at the next iteration boundary.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};
use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};
use x11rb::x11_utils::X11Error;

pub type Result<T, E = WmError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum WmError {
    #[error("failed to connect to the X server: {0}")]
    Connect(#[from] ConnectError),

    #[error("X11 connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("X11 request failed: {0}")]
    Reply(#[from] ReplyError),

    #[error("X11 request failed: {0}")]
    ReplyOrId(#[from] ReplyOrIdError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The window tree could not be left in the expected shape
    #[error("window tree invariant violated: {0}")]
    Invariant(String),

    /// A protocol error arrived after an internal fault was recorded
    #[error("unrecoverable protocol error after internal fault: {0}")]
    Unrecoverable(String),

    #[error("window 0x{0:x} is not managed")]
    NotManaged(u32),
}

impl WmError {
    /// Errors that must stop the reactor instead of being logged and absorbed
    pub fn is_fatal(&self) -> bool {
        match self {
            WmError::Connection(_) | WmError::Io(_) => true,
            WmError::Reply(ReplyError::ConnectionError(_)) => true,
            WmError::ReplyOrId(ReplyOrIdError::ConnectionError(_)) => true,
            WmError::Invariant(_) | WmError::Unrecoverable(_) => true,
            _ => false,
        }
    }

    /// Errors that end the process with an abort rather than an orderly exit
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, WmError::Unrecoverable(_))
    }
}

/// Process-wide "internal error" marker
///
/// Cloning shares the flag. Once raised it stays raised.
#[derive(Debug, Clone, Default)]
pub struct FaultFlag(Arc<AtomicBool>);

impl FaultFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            debug!("Internal fault flag raised");
        }
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The callback every protocol error event is routed through
pub struct ProtocolErrors {
    fault: FaultFlag,
    count: AtomicU64,
    verbose: AtomicBool,
}

impl ProtocolErrors {
    pub fn new(fault: FaultFlag, verbose: bool) -> Self {
        Self {
            fault,
            count: AtomicU64::new(0),
            verbose: AtomicBool::new(verbose),
        }
    }

    /// Report a rejected request
    ///
    /// Returns `WmError::Unrecoverable` when the internal fault flag is
    /// already raised; the caller is expected to abort.
    pub fn report(&self, err: &X11Error) -> Result<()> {
        self.count.fetch_add(1, Ordering::Relaxed);

        if self.verbose.load(Ordering::Relaxed) {
            warn!(
                "X error: {:?} ({}) opcodes {}/{} resource 0x{:x}",
                err.error_kind,
                err.error_code,
                err.major_opcode,
                err.minor_opcode,
                err.bad_value
            );
        }

        if self.fault.is_raised() {
            error!("X error received after an internal fault, giving up");
            return Err(WmError::Unrecoverable(format!(
                "{:?} on request {}/{}",
                err.error_kind, err.major_opcode, err.minor_opcode
            )));
        }

        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Flip diagnostic output, returning the new setting
    pub fn toggle_verbose(&self) -> bool {
        !self.verbose.fetch_xor(true, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x11rb::protocol::ErrorKind;

    fn bad_window() -> X11Error {
        X11Error {
            error_kind: ErrorKind::Window,
            error_code: 3,
            sequence: 42,
            bad_value: 0x1400001,
            minor_opcode: 0,
            major_opcode: 7,
            extension_name: None,
            request_name: Some("ReparentWindow"),
        }
    }

    #[test]
    fn protocol_errors_are_absorbed_until_fault() {
        let fault = FaultFlag::new();
        let errors = ProtocolErrors::new(fault.clone(), false);

        assert!(errors.report(&bad_window()).is_ok());
        assert!(errors.report(&bad_window()).is_ok());
        assert_eq!(errors.count(), 2);

        fault.raise();
        let err = errors.report(&bad_window()).unwrap_err();
        assert!(err.is_unrecoverable());
        assert!(err.is_fatal());
    }

    #[test]
    fn fault_flag_is_shared_between_clones() {
        let fault = FaultFlag::new();
        let other = fault.clone();
        assert!(!other.is_raised());
        fault.raise();
        assert!(other.is_raised());
    }

    #[test]
    fn toggle_verbose_reports_new_state() {
        let errors = ProtocolErrors::new(FaultFlag::new(), true);
        assert!(!errors.toggle_verbose());
        assert!(errors.toggle_verbose());
    }

    #[test]
    fn invariant_errors_are_fatal_but_not_management_misses() {
        assert!(WmError::Invariant("reparent".into()).is_fatal());
        assert!(!WmError::NotManaged(0x200).is_fatal());
    }
}
