use x11rb::protocol::xproto::{EventMask, Window};

use crate::shared::Geometry;
use crate::wm::frame::Frame;

/// A top-level window being managed by the WM
#[derive(Debug)]
pub struct Client {
    /// X11 window ID
    pub window: Window,

    /// Last known on-screen geometry of the client window itself
    pub area: Geometry,

    /// Does the client have a non-rectangular bounding shape?
    pub shaped: bool,

    /// Screen number the client lives on
    pub screen: usize,

    /// Decoration frame, present while the client is managed
    pub frame: Option<Frame>,
}

impl Client {
    pub fn new(window: Window, area: Geometry, shaped: bool, screen: usize) -> Self {
        Self {
            window,
            area,
            shaped,
            screen,
            frame: None,
        }
    }

    /// The mask selected on every managed client window
    pub fn event_mask() -> EventMask {
        EventMask::PROPERTY_CHANGE | EventMask::FOCUS_CHANGE | EventMask::STRUCTURE_NOTIFY
    }

    /// `event_mask` without structure notifications, held while reparenting
    pub fn quiet_event_mask() -> EventMask {
        EventMask::from(
            u32::from(Self::event_mask()) & !u32::from(EventMask::STRUCTURE_NOTIFY),
        )
    }
}
