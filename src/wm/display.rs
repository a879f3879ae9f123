//! Display Module
//!
//! Owns the X11 connection and everything learned about the server at
//! startup: extensions, screens, lock modifiers and cursors. This is the one
//! context object handed to every component that talks to the server.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tracing::{debug, info};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::ReplyError;
use x11rb::protocol::shape::{self, ConnectionExt as _, SK, SO};
use x11rb::protocol::xinerama::{self, ConnectionExt as _};
use x11rb::protocol::xproto::*;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::error::{Result, WmError};
use crate::shared::Geometry;
use crate::wm::frame::{frame_create_mask, WindowOps};
use crate::wm::grab::InputGrabber;
use crate::wm::screen::ScreenInfo;

const XK_NUM_LOCK: Keysym = 0xff7f;
const XK_SCROLL_LOCK: Keysym = 0xff14;
const XK_ESCAPE: Keysym = 0xff1b;

// Glyphs in the core "cursor" font
const XC_FLEUR: u16 = 52;
const XC_WATCH: u16 = 150;

/// X11 extension information
#[derive(Debug, Clone, Default)]
pub struct Extensions {
    pub have_shape: bool,
    pub shape_version: (u16, u16),
    pub shape_event_base: u8,
    /// Negotiated version, `None` when the extension is missing
    pub xinerama_version: Option<(u32, u32)>,
}

impl Extensions {
    fn query(conn: &RustConnection) -> Result<Self> {
        let mut extensions = Self::default();

        if let Some(info) = conn.extension_information(shape::X11_EXTENSION_NAME)? {
            let version = conn.shape_query_version()?.reply()?;
            extensions.have_shape = true;
            extensions.shape_version = (version.major_version, version.minor_version);
            extensions.shape_event_base = info.first_event;
            info!(
                "Found SHAPE extension version {}.{}",
                version.major_version, version.minor_version
            );
        }

        if conn.extension_information(xinerama::X11_EXTENSION_NAME)?.is_some() {
            let version = conn.xinerama_query_version(1, 1)?.reply()?;
            info!("Found Xinerama version {}.{}", version.major, version.minor);
            extensions.xinerama_version = Some((version.major.into(), version.minor.into()));
        }

        Ok(extensions)
    }
}

/// Keyboard lock modifiers and every combination of them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockMasks {
    pub num_lock: u16,
    pub scroll_lock: u16,
    /// Index 4 and up include ScrollLock
    pub list: [u16; 8],
}

impl LockMasks {
    pub fn new(num_lock: u16, scroll_lock: u16) -> Self {
        let caps = u16::from(ModMask::LOCK);
        Self {
            num_lock,
            scroll_lock,
            list: [
                0,
                caps,
                num_lock,
                caps | num_lock,
                scroll_lock,
                scroll_lock | caps,
                scroll_lock | num_lock,
                scroll_lock | caps | num_lock,
            ],
        }
    }

    /// Lock combinations a button grab is repeated for
    pub fn combinations(&self, allow_scroll_lock: bool) -> &[u16] {
        if allow_scroll_lock {
            &self.list[..self.list.len() / 2]
        } else {
            &self.list
        }
    }

    /// `state` with every lock modifier cleared
    pub fn strip(&self, state: u16) -> u16 {
        state & !(u16::from(ModMask::LOCK) | self.num_lock | self.scroll_lock)
    }
}

/// First keycode bound to `keysym`, in keycode order
pub fn keysym_to_keycode(
    min_keycode: Keycode,
    keysyms_per_keycode: u8,
    keysyms: &[Keysym],
    keysym: Keysym,
) -> Option<Keycode> {
    if keysyms_per_keycode == 0 {
        return None;
    }
    keysyms
        .chunks(keysyms_per_keycode.into())
        .position(|syms| syms.contains(&keysym))
        .and_then(|i| u8::try_from(usize::from(min_keycode) + i).ok())
}

/// Modifier mask whose row of the modifier map holds `keycode`
pub fn modifier_mask_for(keycode: Option<Keycode>, keycodes_per_modifier: u8, modmap: &[Keycode]) -> u16 {
    let Some(keycode) = keycode else {
        return 0;
    };
    if keycodes_per_modifier == 0 {
        return 0;
    }
    let mut mask = 0;
    for (i, &code) in modmap.iter().enumerate() {
        if code != 0 && code == keycode {
            mask = 1 << (i / usize::from(keycodes_per_modifier));
        }
    }
    mask
}

/// A window as found before managing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowInfo {
    pub root: Window,
    pub area: Geometry,
    pub override_redirect: bool,
    pub viewable: bool,
}

/// Cursors created once at startup
#[derive(Debug, Clone, Copy)]
pub struct Cursors {
    pub busy: Cursor,
    pub move_cursor: Cursor,
}

impl Cursors {
    fn new(conn: &RustConnection) -> Result<Self> {
        let font = conn.generate_id()?;
        conn.open_font(font, b"cursor")?;

        let create_cursor = |glyph: u16| -> Result<Cursor> {
            let cursor = conn.generate_id()?;
            conn.create_glyph_cursor(
                cursor, font, font, glyph, glyph + 1, 0, 0, 0, 0xffff, 0xffff, 0xffff,
            )?;
            Ok(cursor)
        };

        let cursors = Self {
            busy: create_cursor(XC_WATCH)?,
            move_cursor: create_cursor(XC_FLEUR)?,
        };
        conn.close_font(font)?;
        Ok(cursors)
    }
}

/// Server requests the window manager issues beyond frame and grab work
pub trait DisplayOps: WindowOps + InputGrabber {
    fn screens(&self) -> &[ScreenInfo];

    fn screen_info(&self, screen_number: usize) -> Option<&ScreenInfo> {
        self.screens().get(screen_number)
    }

    /// Screen whose root is `root`
    fn screen_for_root(&self, root: Window) -> Option<&ScreenInfo> {
        self.screens().iter().find(|s| s.root() == root)
    }

    /// One line about the connection, for state dumps
    fn describe(&self) -> String;

    fn flush(&self) -> Result<()>;

    /// Take over window management on `root`
    fn become_manager(&self, root: Window) -> Result<()>;

    /// Children of `root`, bottom to top
    fn children(&self, root: Window) -> Result<Vec<Window>>;

    /// What the manager needs to know about a window before managing it
    ///
    /// `None` when the window vanished in the meantime.
    fn window_info(&self, window: Window) -> Result<Option<WindowInfo>>;

    /// Whether the window has a non-rectangular bounding shape
    fn is_shaped(&self, window: Window) -> Result<bool>;

    /// Ask for ShapeNotify events on `window`
    fn select_shape_input(&self, window: Window) -> Result<()>;

    fn configure_window(&self, window: Window, aux: &ConfigureWindowAux) -> Result<()>;

    /// Tell a client where it ended up, as ICCCM asks of a reparenting manager
    fn send_configure_notify(&self, window: Window, area: Geometry) -> Result<()>;

    /// Ask for an expose of the whole window
    fn clear_area(&self, window: Window) -> Result<()>;

    /// Passive Button1 grab on a frame under `modifiers`, for moves
    fn grab_move_button(&self, frame: Window, modifiers: u16) -> Result<()>;

    fn ungrab_move_button(&self, frame: Window, modifiers: u16) -> Result<()>;

    /// Let the keyboard run again after a synchronous grab froze it
    fn thaw_keyboard(&self) -> Result<()>;

    /// `state` with every lock modifier cleared
    fn strip_locks(&self, state: u16) -> u16;

    fn escape_keycode(&self) -> Option<Keycode>;

    fn busy_cursor(&self) -> Cursor;
}

/// Display - The connection and its server-wide state
pub struct Display {
    conn: Arc<RustConnection>,
    name: String,
    screens: Vec<ScreenInfo>,
    extensions: Extensions,
    locks: LockMasks,
    escape_keycode: Option<Keycode>,
    cursors: Cursors,
    /// Events read ahead while looking for a specific one
    deferred: RefCell<VecDeque<Event>>,
}

impl Display {
    /// Connect to `name` (or `$DISPLAY`) and query the server
    pub fn open(name: Option<&str>) -> Result<Self> {
        let (conn, default_screen) = x11rb::connect(name)?;
        ensure_cloexec(&conn)?;

        let name = name
            .map(str::to_owned)
            .or_else(|| std::env::var("DISPLAY").ok())
            .unwrap_or_else(|| ":0".to_string());
        info!("Connected to X display {} (default screen {})", name, default_screen);

        let extensions = Extensions::query(&conn)?;

        let screens = (0..conn.setup().roots.len())
            .map(|n| ScreenInfo::query(&conn, &name, n, extensions.xinerama_version))
            .collect::<Result<Vec<_>>>()?;

        let (locks, escape_keycode) = query_keyboard(&conn)?;
        debug!(
            "Lock masks: NumLock=0x{:x} ScrollLock=0x{:x}",
            locks.num_lock, locks.scroll_lock
        );

        let cursors = Cursors::new(&conn)?;

        Ok(Self {
            conn: Arc::new(conn),
            name,
            screens,
            extensions,
            locks,
            escape_keycode,
            cursors,
            deferred: RefCell::new(VecDeque::new()),
        })
    }

    pub fn conn(&self) -> &Arc<RustConnection> {
        &self.conn
    }

    /// Next event, read-ahead events first
    pub fn next_event(&self) -> Result<Option<Event>> {
        if let Some(event) = self.deferred.borrow_mut().pop_front() {
            return Ok(Some(event));
        }
        Ok(self.conn.poll_for_event()?)
    }

    /// Grab a button in combination with every keyboard lock state
    ///
    /// With `allow_scroll_lock` ScrollLock is left out, so it still cancels
    /// the binding.
    #[allow(clippy::too_many_arguments)]
    pub fn grab_button(
        &self,
        button: ButtonIndex,
        modifiers: u16,
        grab_window: Window,
        owner_events: bool,
        event_mask: EventMask,
        pointer_mode: GrabMode,
        keyboard_mode: GrabMode,
        confine_to: Window,
        cursor: Cursor,
        allow_scroll_lock: bool,
    ) -> Result<()> {
        for &locks in self.locks.combinations(allow_scroll_lock) {
            self.conn.grab_button(
                owner_events,
                grab_window,
                event_mask,
                pointer_mode,
                keyboard_mode,
                confine_to,
                cursor,
                button,
                ModMask::from(modifiers | locks),
            )?;
        }
        Ok(())
    }

    /// Undo `grab_button` for every lock combination
    pub fn ungrab_button(&self, button: ButtonIndex, modifiers: u16, grab_window: Window) -> Result<()> {
        for &locks in self.locks.combinations(false) {
            self.conn
                .ungrab_button(button, grab_window, ModMask::from(modifiers | locks))?;
        }
        Ok(())
    }
}

impl DisplayOps for Display {
    fn screens(&self) -> &[ScreenInfo] {
        &self.screens
    }

    fn describe(&self) -> String {
        format!(
            "display {} shape {:?} (events from {}) xinerama {:?}",
            self.name,
            self.extensions.have_shape.then_some(self.extensions.shape_version),
            self.extensions.shape_event_base,
            self.extensions.xinerama_version
        )
    }

    fn flush(&self) -> Result<()> {
        self.conn.flush()?;
        Ok(())
    }

    fn become_manager(&self, root: Window) -> Result<()> {
        let mask = EventMask::SUBSTRUCTURE_REDIRECT | EventMask::SUBSTRUCTURE_NOTIFY;
        self.conn
            .change_window_attributes(root, &ChangeWindowAttributesAux::new().event_mask(mask))?
            .check()
            .map_err(|e| WmError::Invariant(format!("another window manager is running: {}", e)))?;
        Ok(())
    }

    fn children(&self, root: Window) -> Result<Vec<Window>> {
        Ok(self.conn.query_tree(root)?.reply()?.children)
    }

    fn window_info(&self, window: Window) -> Result<Option<WindowInfo>> {
        let attrs = match self.conn.get_window_attributes(window)?.reply() {
            Ok(attrs) => attrs,
            Err(ReplyError::X11Error(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let geometry = match self.conn.get_geometry(window)?.reply() {
            Ok(g) => g,
            Err(ReplyError::X11Error(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(WindowInfo {
            root: geometry.root,
            area: Geometry::new(
                geometry.x.into(),
                geometry.y.into(),
                geometry.width.into(),
                geometry.height.into(),
            ),
            override_redirect: attrs.override_redirect,
            viewable: attrs.map_state == MapState::VIEWABLE,
        }))
    }

    fn is_shaped(&self, window: Window) -> Result<bool> {
        if !self.extensions.have_shape {
            return Ok(false);
        }
        match self.conn.shape_query_extents(window)?.reply() {
            Ok(extents) => Ok(extents.bounding_shaped),
            Err(ReplyError::X11Error(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn select_shape_input(&self, window: Window) -> Result<()> {
        if self.extensions.have_shape {
            self.conn.shape_select_input(window, true)?;
        }
        Ok(())
    }

    fn configure_window(&self, window: Window, aux: &ConfigureWindowAux) -> Result<()> {
        self.conn.configure_window(window, aux)?;
        Ok(())
    }

    fn send_configure_notify(&self, window: Window, area: Geometry) -> Result<()> {
        let event = ConfigureNotifyEvent {
            response_type: CONFIGURE_NOTIFY_EVENT,
            sequence: 0,
            event: window,
            window,
            above_sibling: x11rb::NONE,
            x: clamp_i16(area.x),
            y: clamp_i16(area.y),
            width: clamp_u16(area.width),
            height: clamp_u16(area.height),
            border_width: 0,
            override_redirect: false,
        };
        self.conn
            .send_event(false, window, EventMask::STRUCTURE_NOTIFY, event)?;
        Ok(())
    }

    fn clear_area(&self, window: Window) -> Result<()> {
        self.conn.clear_area(true, window, 0, 0, 0, 0)?;
        Ok(())
    }

    fn grab_move_button(&self, frame: Window, modifiers: u16) -> Result<()> {
        self.grab_button(
            ButtonIndex::M1,
            modifiers,
            frame,
            false,
            EventMask::BUTTON_PRESS | EventMask::BUTTON_RELEASE | EventMask::BUTTON_MOTION,
            GrabMode::ASYNC,
            GrabMode::ASYNC,
            x11rb::NONE,
            self.cursors.move_cursor,
            false,
        )
    }

    fn ungrab_move_button(&self, frame: Window, modifiers: u16) -> Result<()> {
        self.ungrab_button(ButtonIndex::M1, modifiers, frame)
    }

    fn thaw_keyboard(&self) -> Result<()> {
        self.conn.allow_events(Allow::ASYNC_KEYBOARD, x11rb::CURRENT_TIME)?;
        Ok(())
    }

    fn strip_locks(&self, state: u16) -> u16 {
        self.locks.strip(state)
    }

    fn escape_keycode(&self) -> Option<Keycode> {
        self.escape_keycode
    }

    fn busy_cursor(&self) -> Cursor {
        self.cursors.busy
    }
}

impl WindowOps for Display {
    fn create_frame_window(&self, screen: &ScreenInfo, border_width: u32) -> Result<Window> {
        let window = self.conn.generate_id()?;
        self.conn.create_window(
            screen.depth(),
            window,
            screen.root(),
            0,
            0,
            1,
            1,
            clamp_u16(border_width),
            WindowClass::INPUT_OUTPUT,
            screen.visual(),
            &CreateWindowAux::new()
                .background_pixmap(x11rb::NONE)
                .border_pixel(0)
                .colormap(screen.colormap())
                .override_redirect(1)
                .event_mask(frame_create_mask()),
        )?;
        Ok(window)
    }

    fn destroy_window(&self, window: Window) -> Result<()> {
        self.conn.destroy_window(window)?;
        Ok(())
    }

    fn grab_server(&self) -> Result<()> {
        self.conn.grab_server()?;
        Ok(())
    }

    fn ungrab_server(&self) -> Result<()> {
        self.conn.ungrab_server()?;
        Ok(())
    }

    fn select_input(&self, window: Window, mask: EventMask) -> Result<()> {
        self.conn
            .change_window_attributes(window, &ChangeWindowAttributesAux::new().event_mask(mask))?;
        Ok(())
    }

    fn reparent_window(&self, window: Window, parent: Window, x: i32, y: i32) -> Result<()> {
        self.conn
            .reparent_window(window, parent, clamp_i16(x), clamp_i16(y))?;
        Ok(())
    }

    fn raise_window(&self, window: Window) -> Result<()> {
        self.configure_window(window, &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE))
    }

    fn map_window(&self, window: Window) -> Result<()> {
        self.conn.map_window(window)?;
        Ok(())
    }

    fn move_window(&self, window: Window, x: i32, y: i32) -> Result<()> {
        self.configure_window(window, &ConfigureWindowAux::new().x(x).y(y))
    }

    fn resize_window(&self, window: Window, width: u32, height: u32) -> Result<()> {
        self.configure_window(
            window,
            &ConfigureWindowAux::new().width(width.max(1)).height(height.max(1)),
        )
    }

    fn set_border_width(&self, window: Window, width: u32) -> Result<()> {
        self.configure_window(window, &ConfigureWindowAux::new().border_width(width))
    }

    fn shape_from_client(&self, frame: Window, client: Window, x: i32, y: i32) -> Result<()> {
        if self.extensions.have_shape {
            self.conn.shape_combine(
                SO::SET,
                SK::BOUNDING,
                SK::BOUNDING,
                frame,
                clamp_i16(x),
                clamp_i16(y),
                client,
            )?;
        }
        Ok(())
    }

    fn clear_shape(&self, frame: Window) -> Result<()> {
        if self.extensions.have_shape {
            self.conn
                .shape_mask(SO::SET, SK::BOUNDING, frame, 0, 0, x11rb::NONE)?;
        }
        Ok(())
    }

    fn take_reparent_notify(&self, window: Window) -> Result<bool> {
        let mut deferred = self.deferred.borrow_mut();
        while let Some(event) = self.conn.poll_for_event()? {
            deferred.push_back(event);
        }
        let found = deferred
            .iter()
            .position(|e| matches!(e, Event::ReparentNotify(n) if is_own_reparent(n, window)));
        Ok(found.and_then(|i| deferred.remove(i)).is_some())
    }
}

impl InputGrabber for Display {
    fn grab_keyboard(&self, root: Window) -> Result<()> {
        self.conn
            .grab_keyboard(false, root, x11rb::CURRENT_TIME, GrabMode::ASYNC, GrabMode::SYNC)?
            .discard_reply_and_errors();
        Ok(())
    }

    fn ungrab_keyboard(&self) -> Result<()> {
        self.conn.ungrab_keyboard(x11rb::CURRENT_TIME)?;
        Ok(())
    }

    fn grab_pointer(&self, root: Window, cursor: Cursor) -> Result<()> {
        self.conn
            .grab_pointer(
                false,
                root,
                EventMask::NO_EVENT,
                GrabMode::ASYNC,
                GrabMode::SYNC,
                x11rb::NONE,
                cursor,
                x11rb::CURRENT_TIME,
            )?
            .discard_reply_and_errors();
        Ok(())
    }

    fn ungrab_pointer(&self) -> Result<()> {
        self.conn.ungrab_pointer(x11rb::CURRENT_TIME)?;
        Ok(())
    }
}

/// Whether `event` is `window`'s own report of a reparent
///
/// The root's SubstructureNotify copy of the manager's reparent into the
/// frame names the root as `event` and does not count.
pub fn is_own_reparent(event: &ReparentNotifyEvent, window: Window) -> bool {
    event.event == window && event.window == window
}

/// Mark the connection descriptor close-on-exec
fn ensure_cloexec(conn: &RustConnection) -> Result<()> {
    // SAFETY: the descriptor stays open for as long as `conn` is alive.
    let fd = unsafe { BorrowedFd::borrow_raw(conn.stream().as_raw_fd()) };
    let flags = fcntl(fd, FcntlArg::F_GETFD).map_err(std::io::Error::from)?;
    let flags = FdFlag::from_bits_truncate(flags);
    if !flags.contains(FdFlag::FD_CLOEXEC) {
        debug!("Setting close-on-exec on the display connection");
        fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC)).map_err(std::io::Error::from)?;
    }
    Ok(())
}

/// Lock masks from the modifier map, plus the Escape keycode
fn query_keyboard(conn: &RustConnection) -> Result<(LockMasks, Option<Keycode>)> {
    let setup = conn.setup();
    let min = setup.min_keycode;
    let count = setup.max_keycode - min + 1;
    let mapping = conn.get_keyboard_mapping(min, count)?.reply()?;
    let keycode = |sym| keysym_to_keycode(min, mapping.keysyms_per_keycode, &mapping.keysyms, sym);

    let modmap = conn.get_modifier_mapping()?.reply()?;
    let per = modmap.keycodes_per_modifier();
    let num_lock = modifier_mask_for(keycode(XK_NUM_LOCK), per, &modmap.keycodes);
    let scroll_lock = modifier_mask_for(keycode(XK_SCROLL_LOCK), per, &modmap.keycodes);

    Ok((LockMasks::new(num_lock, scroll_lock), keycode(XK_ESCAPE)))
}

fn clamp_i16(v: i32) -> i16 {
    v.clamp(i16::MIN.into(), i16::MAX.into()) as i16
}

fn clamp_u16(v: u32) -> u16 {
    u16::try_from(v).unwrap_or(u16::MAX)
}
