//! Grab Module
//!
//! Reference-counted exclusive ownership of the keyboard and pointer.
//! Nested callers may acquire a device that is already held; the device grab
//! is only issued on the 0→1 transition and only dropped on 1→0.

use tracing::{debug, warn};
use x11rb::protocol::xproto::{Cursor, Window};

use crate::error::Result;

/// The device grab requests the registry issues
///
/// Requests are fire-and-forget; a rejected grab shows up later as a
/// protocol error, not here.
pub trait InputGrabber {
    fn grab_keyboard(&self, root: Window) -> Result<()>;
    fn ungrab_keyboard(&self) -> Result<()>;
    fn grab_pointer(&self, root: Window, cursor: Cursor) -> Result<()>;
    fn ungrab_pointer(&self) -> Result<()>;
}

/// Keyboard and pointer grab counters
#[derive(Debug)]
pub struct GrabRegistry {
    root: Window,
    keyboard: u32,
    pointer: u32,
}

impl GrabRegistry {
    pub fn new(root: Window) -> Self {
        Self {
            root,
            keyboard: 0,
            pointer: 0,
        }
    }

    pub fn acquire_keyboard(&mut self, dev: &impl InputGrabber) -> Result<()> {
        self.keyboard += 1;
        if self.keyboard == 1 {
            debug!("Grabbing keyboard on root 0x{:x}", self.root);
            dev.grab_keyboard(self.root)?;
        }
        Ok(())
    }

    pub fn release_keyboard(&mut self, dev: &impl InputGrabber) -> Result<()> {
        if self.keyboard == 0 {
            return Ok(());
        }
        self.keyboard -= 1;
        if self.keyboard == 0 {
            debug!("Releasing keyboard grab");
            dev.ungrab_keyboard()?;
        }
        Ok(())
    }

    pub fn acquire_pointer(&mut self, dev: &impl InputGrabber, cursor: Cursor) -> Result<()> {
        self.pointer += 1;
        if self.pointer == 1 {
            debug!("Grabbing pointer on root 0x{:x}", self.root);
            dev.grab_pointer(self.root, cursor)?;
        }
        Ok(())
    }

    pub fn release_pointer(&mut self, dev: &impl InputGrabber) -> Result<()> {
        if self.pointer == 0 {
            return Ok(());
        }
        self.pointer -= 1;
        if self.pointer == 0 {
            debug!("Releasing pointer grab");
            dev.ungrab_pointer()?;
        }
        Ok(())
    }

    /// Release every outstanding grab regardless of nesting depth
    ///
    /// Counters always end at zero, even if an ungrab request fails.
    pub fn shutdown(&mut self, dev: &impl InputGrabber) {
        while self.keyboard > 0 {
            if let Err(e) = self.release_keyboard(dev) {
                warn!("Failed to release keyboard grab: {}", e);
            }
        }
        while self.pointer > 0 {
            if let Err(e) = self.release_pointer(dev) {
                warn!("Failed to release pointer grab: {}", e);
            }
        }
    }

    pub fn keyboard_depth(&self) -> u32 {
        self.keyboard
    }

    pub fn pointer_depth(&self) -> u32 {
        self.pointer
    }
}
