//! Frame Module
//!
//! A frame is the decoration window a managed client is reparented into.
//!
//! ```text
//! Unattached --attach--> Attached --release--> Releasing --> Unattached
//! ```
//!
//! The reparent into the frame happens under a whole-server grab so no other
//! client observes a half-built window tree. Release always leaves the client
//! parented to the root; destroying the decoration window is the caller's job.

use tracing::{debug, trace};
use x11rb::protocol::xproto::{EventMask, Window};

use crate::error::{Result, WmError};
use crate::shared::{Geometry, Insets};
use crate::wm::client::Client;
use crate::wm::screen::ScreenInfo;

/// Window tree requests a frame needs
pub trait WindowOps {
    /// Create a 1x1 override-redirect decoration window at the origin of the
    /// screen's root
    fn create_frame_window(&self, screen: &ScreenInfo, border_width: u32) -> Result<Window>;
    fn destroy_window(&self, window: Window) -> Result<()>;
    fn grab_server(&self) -> Result<()>;
    fn ungrab_server(&self) -> Result<()>;
    fn select_input(&self, window: Window, mask: EventMask) -> Result<()>;
    fn reparent_window(&self, window: Window, parent: Window, x: i32, y: i32) -> Result<()>;
    fn raise_window(&self, window: Window) -> Result<()>;
    fn map_window(&self, window: Window) -> Result<()>;
    fn move_window(&self, window: Window, x: i32, y: i32) -> Result<()>;
    fn resize_window(&self, window: Window, width: u32, height: u32) -> Result<()>;
    fn set_border_width(&self, window: Window, width: u32) -> Result<()>;
    /// Set `frame`'s bounding shape from `client`'s, offset by (x, y)
    fn shape_from_client(&self, frame: Window, client: Window, x: i32, y: i32) -> Result<()>;
    /// Reset `frame`'s bounding shape to its plain rectangle
    fn clear_shape(&self, frame: Window) -> Result<()>;
    /// Remove a pending ReparentNotify for `window` from the input queue
    fn take_reparent_notify(&self, window: Window) -> Result<bool>;
}

/// Visual parameters a frame consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style {
    pub border_width: u32,
    pub margin: u32,
    pub title_height: u32,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            border_width: 1,
            margin: 2,
            title_height: 0,
        }
    }
}

impl Style {
    pub fn insets(&self) -> Insets {
        Insets {
            top: self.margin + self.title_height,
            ..Insets::uniform(self.margin)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Unattached,
    Attached,
    Releasing,
}

/// Events selected on the decoration window at creation
pub fn frame_create_mask() -> EventMask {
    EventMask::ENTER_WINDOW | EventMask::LEAVE_WINDOW | EventMask::BUTTON_PRESS
}

/// Events selected on the decoration window once it holds a client
pub fn frame_event_mask() -> EventMask {
    frame_create_mask() | EventMask::SUBSTRUCTURE_REDIRECT
}

#[derive(Debug)]
pub struct Frame {
    window: Window,
    client: Window,
    root: Window,
    style: Style,
    insets: Insets,
    state: FrameState,
    needs_redraw: bool,
}

impl Frame {
    /// Create the decoration window and attach `client` to it
    pub fn new(ops: &impl WindowOps, screen: &ScreenInfo, client: &Client, style: Style) -> Result<Self> {
        let window = ops.create_frame_window(screen, style.border_width)?;
        let mut frame = Self {
            window,
            client: client.window,
            root: screen.root(),
            style,
            insets: style.insets(),
            state: FrameState::Unattached,
            needs_redraw: false,
        };

        if let Err(e) = frame.attach(ops, client) {
            let _ = ops.destroy_window(window);
            return Err(e);
        }
        Ok(frame)
    }

    /// Reparent the client into the decoration window
    pub fn attach(&mut self, ops: &impl WindowOps, client: &Client) -> Result<()> {
        if self.state != FrameState::Unattached {
            return Err(WmError::Invariant(format!(
                "attach of 0x{:x} to frame 0x{:x} in state {:?}",
                client.window, self.window, self.state
            )));
        }

        let (x, y) = self.client_offset();
        with_server_grab(ops, || {
            ops.select_input(self.window, frame_event_mask())?;

            // The client must not see its own reparent as a structure change.
            ops.select_input(client.window, Client::quiet_event_mask())?;
            ops.reparent_window(client.window, self.window, x, y)?;
            ops.select_input(client.window, Client::event_mask())?;

            ops.raise_window(client.window)?;
            ops.map_window(client.window)?;
            Ok(())
        })?;

        self.client = client.window;
        self.state = FrameState::Attached;
        debug!("Frame 0x{:x} holds client 0x{:x}", self.window, client.window);

        self.resize(ops, client)?;
        self.shape(ops, client)
    }

    /// Replace the active style
    ///
    /// Before the frame holds a client only the insets change.
    pub fn set_style(&mut self, ops: &impl WindowOps, client: &Client, style: Style) -> Result<()> {
        self.style = style;
        self.insets = style.insets();

        if self.state != FrameState::Attached {
            return Ok(());
        }

        self.resize(ops, client)?;
        ops.set_border_width(self.window, style.border_width)?;
        let (x, y) = self.client_offset();
        ops.move_window(client.window, x, y)?;
        self.needs_redraw = true;
        Ok(())
    }

    /// Fit the decoration window around the client's current size
    pub fn resize(&self, ops: &impl WindowOps, client: &Client) -> Result<()> {
        let outer = client.area.expand(self.insets);
        trace!("Frame 0x{:x} resized to {}x{}", self.window, outer.width, outer.height);
        ops.resize_window(self.window, outer.width, outer.height)
    }

    /// Recompute the frame's bounding shape from the client's
    pub fn shape(&self, ops: &impl WindowOps, client: &Client) -> Result<()> {
        if client.shaped {
            let (x, y) = self.client_offset();
            ops.shape_from_client(self.window, client.window, x, y)
        } else {
            ops.clear_shape(self.window)
        }
    }

    /// Move the decoration window so the client lands on `client.area`
    pub fn place(&self, ops: &impl WindowOps, client: &Client) -> Result<()> {
        let outer = self.outer_geometry(client.area);
        ops.move_window(self.window, outer.x, outer.y)
    }

    /// Outer geometry of the decoration window for a client at `area`
    ///
    /// The origin includes the frame's own border, as X positions a window by
    /// the outer corner of its border.
    pub fn outer_geometry(&self, area: Geometry) -> Geometry {
        let mut outer = area.expand(self.insets);
        outer.x -= self.style.border_width as i32;
        outer.y -= self.style.border_width as i32;
        outer
    }

    /// Client position that corresponds to the frame at (`x`, `y`)
    pub fn client_origin(&self, x: i32, y: i32) -> (i32, i32) {
        let bw = self.style.border_width as i32;
        (x + bw + self.insets.left as i32, y + bw + self.insets.top as i32)
    }

    /// Hand the client back to the root window
    ///
    /// If the client already reparented itself away, a remap is implied.
    pub fn release(&mut self, ops: &impl WindowOps, client: &Client, remap: bool) -> Result<()> {
        if self.state != FrameState::Attached || self.client != client.window {
            return Err(WmError::Invariant(format!(
                "release of 0x{:x} from frame 0x{:x} holding 0x{:x} in state {:?}",
                client.window, self.window, self.client, self.state
            )));
        }
        self.state = FrameState::Releasing;

        let mut remap = remap;
        if ops.take_reparent_notify(client.window)? {
            debug!("Client 0x{:x} already reparented itself", client.window);
            remap = true;
        } else {
            ops.reparent_window(client.window, self.root, client.area.x, client.area.y)?;
        }

        if remap {
            ops.map_window(client.window)?;
        }

        self.state = FrameState::Unattached;
        debug!("Frame 0x{:x} released client 0x{:x}", self.window, client.window);
        Ok(())
    }

    fn client_offset(&self) -> (i32, i32) {
        (self.insets.left as i32, self.insets.top as i32)
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn style(&self) -> Style {
        self.style
    }

    /// Clear and return the redraw request left by a style change
    pub fn take_redraw(&mut self) -> bool {
        std::mem::take(&mut self.needs_redraw)
    }
}

/// Run `f` with the whole server grabbed
///
/// The server is ungrabbed even when `f` fails; the first error wins.
pub fn with_server_grab<O, T>(ops: &O, f: impl FnOnce() -> Result<T>) -> Result<T>
where
    O: WindowOps + ?Sized,
{
    ops.grab_server()?;
    let result = f();
    let ungrab = ops.ungrab_server();
    let value = result?;
    ungrab?;
    Ok(value)
}
