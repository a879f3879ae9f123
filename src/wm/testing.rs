//! In-memory stand-in for the X server, for unit tests
//!
//! Tracks the window tree, mapped state, event masks, server grab depth and
//! device grabs. All requests succeed unless told otherwise. The fake has a
//! single 1920x1080 screen; NumLock is Mod2 and Escape is keycode 9.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use x11rb::protocol::xproto::{
    ConfigureWindowAux, Cursor, EventMask, Keycode, ModMask, ReparentNotifyEvent, Window,
    REPARENT_NOTIFY_EVENT,
};

use crate::config::Config;
use crate::error::{FaultFlag, ProtocolErrors, Result, WmError};
use crate::shared::Geometry;
use crate::wm::display::{is_own_reparent, DisplayOps, WindowInfo};
use crate::wm::frame::{frame_create_mask, WindowOps};
use crate::wm::grab::InputGrabber;
use crate::wm::screen::ScreenInfo;
use crate::wm::WindowManager;

/// A window manager with the default configuration driving `server`
pub fn manager(server: &Rc<FakeServer>) -> WindowManager<FakeServer> {
    manager_with_config(server, None)
}

/// As `manager`, re-reading its style from `config_path` on SIGHUP
pub fn manager_with_config(server: &Rc<FakeServer>, config_path: Option<PathBuf>) -> WindowManager<FakeServer> {
    let errors = ProtocolErrors::new(FaultFlag::new(), false);
    WindowManager::new(Rc::clone(server), &Config::default(), config_path, errors).unwrap()
}

#[derive(Debug, Clone)]
struct FakeWindow {
    parent: Window,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    border_width: u32,
    mapped: bool,
    mask: Option<EventMask>,
    /// Mask in effect when the window was last reparented by the WM
    mask_at_reparent: Option<EventMask>,
    shaped_from: Option<(Window, i32, i32)>,
    override_redirect: bool,
    bounding_shaped: bool,
    shape_selected: bool,
}

impl FakeWindow {
    fn child_of(parent: Window) -> Self {
        Self {
            parent,
            x: 0,
            y: 0,
            width: 1,
            height: 1,
            border_width: 0,
            mapped: false,
            mask: None,
            mask_at_reparent: None,
            shaped_from: None,
            override_redirect: false,
            bounding_shaped: false,
            shape_selected: false,
        }
    }
}

pub const ROOT: Window = 0x100;
pub const ESCAPE_KEYCODE: Keycode = 9;
pub const BUSY_CURSOR: Cursor = 0x50;

#[derive(Debug, Default)]
pub struct FakeServer {
    root: Window,
    screens: Vec<ScreenInfo>,
    managed_roots: RefCell<Vec<Window>>,
    configure_notifies: RefCell<Vec<(Window, Geometry)>>,
    button_grabs: RefCell<HashMap<Window, u16>>,
    clears: Cell<u32>,
    thaws: Cell<u32>,
    windows: RefCell<HashMap<Window, FakeWindow>>,
    next_id: Cell<Window>,
    /// ReparentNotify events not yet read, in delivery order
    reparent_notifies: RefCell<Vec<ReparentNotifyEvent>>,
    server_grab_depth: Cell<u32>,
    server_grabs: Cell<u32>,
    reparent_requests: Cell<u32>,
    destroyed: Cell<u32>,
    fail_reparent: Cell<bool>,
    keyboard: Cell<bool>,
    keyboard_grab_requests: Cell<u32>,
    keyboard_ungrab_requests: Cell<u32>,
    pointer: Cell<Option<Cursor>>,
    pointer_grab_cursors: RefCell<Vec<Cursor>>,
}

impl FakeServer {
    pub fn new(root: Window) -> Self {
        Self {
            root,
            screens: vec![ScreenInfo::synthetic(root, 1920, 1080)],
            next_id: Cell::new(0x600000),
            ..Self::default()
        }
    }

    /// A top-level client at `area`, mapped unless `override_redirect`
    pub fn add_client(&self, window: Window, area: Geometry, override_redirect: bool) {
        let mut w = FakeWindow::child_of(self.root);
        w.x = area.x;
        w.y = area.y;
        w.width = area.width;
        w.height = area.height;
        w.mapped = !override_redirect;
        w.override_redirect = override_redirect;
        self.windows.borrow_mut().insert(window, w);
    }

    pub fn set_bounding_shaped(&self, window: Window, shaped: bool) {
        let _ = self.update(window, |w| w.bounding_shaped = shaped);
    }

    pub fn shape_selected(&self, window: Window) -> bool {
        self.get(window, |w| w.shape_selected).unwrap_or(false)
    }

    pub fn exists(&self, window: Window) -> bool {
        self.windows.borrow().contains_key(&window)
    }

    pub fn managed_roots(&self) -> Vec<Window> {
        self.managed_roots.borrow().clone()
    }

    pub fn configure_notifies(&self) -> Vec<(Window, Geometry)> {
        self.configure_notifies.borrow().clone()
    }

    /// Modifiers of the move button grab on `frame`
    pub fn move_button_grab(&self, frame: Window) -> Option<u16> {
        self.button_grabs.borrow().get(&frame).copied()
    }

    pub fn clears(&self) -> u32 {
        self.clears.get()
    }

    pub fn thaws(&self) -> u32 {
        self.thaws.get()
    }

    pub fn add_window(&self, window: Window, parent: Window) {
        self.windows
            .borrow_mut()
            .insert(window, FakeWindow::child_of(parent));
    }

    fn get<T>(&self, window: Window, f: impl FnOnce(&FakeWindow) -> T) -> Option<T> {
        self.windows.borrow().get(&window).map(f)
    }

    fn update(&self, window: Window, f: impl FnOnce(&mut FakeWindow)) -> Result<()> {
        match self.windows.borrow_mut().get_mut(&window) {
            Some(w) => {
                f(w);
                Ok(())
            }
            None => Err(WmError::NotManaged(window)),
        }
    }

    pub fn parent_of(&self, window: Window) -> Option<Window> {
        self.get(window, |w| w.parent)
    }

    pub fn position_of(&self, window: Window) -> Option<(i32, i32)> {
        self.get(window, |w| (w.x, w.y))
    }

    pub fn size_of(&self, window: Window) -> Option<(u32, u32)> {
        self.get(window, |w| (w.width, w.height))
    }

    pub fn border_width_of(&self, window: Window) -> Option<u32> {
        self.get(window, |w| w.border_width)
    }

    pub fn is_mapped(&self, window: Window) -> bool {
        self.get(window, |w| w.mapped).unwrap_or(false)
    }

    pub fn event_mask_of(&self, window: Window) -> Option<EventMask> {
        self.get(window, |w| w.mask).flatten()
    }

    pub fn mask_at_reparent(&self, window: Window) -> Option<EventMask> {
        self.get(window, |w| w.mask_at_reparent).flatten()
    }

    pub fn shaped_from(&self, window: Window) -> Option<(Window, i32, i32)> {
        self.get(window, |w| w.shaped_from).flatten()
    }

    pub fn unmap(&self, window: Window) {
        let _ = self.update(window, |w| w.mapped = false);
    }

    /// The client reparents itself; its ReparentNotify is left queued
    pub fn client_reparents(&self, window: Window, parent: Window, x: i32, y: i32) {
        let _ = self.update(window, |w| {
            w.parent = parent;
            w.x = x;
            w.y = y;
        });
        self.queue_reparent_notify(window, window, parent);
    }

    fn queue_reparent_notify(&self, event: Window, window: Window, parent: Window) {
        self.reparent_notifies.borrow_mut().push(ReparentNotifyEvent {
            response_type: REPARENT_NOTIFY_EVENT,
            sequence: 0,
            event,
            window,
            parent,
            x: 0,
            y: 0,
            override_redirect: false,
        });
    }

    /// Queued ReparentNotify events as (event, window, parent)
    pub fn queued_reparent_notifies(&self) -> Vec<(Window, Window, Window)> {
        self.reparent_notifies
            .borrow()
            .iter()
            .map(|n| (n.event, n.window, n.parent))
            .collect()
    }

    pub fn fail_reparent(&self) {
        self.fail_reparent.set(true);
    }

    pub fn server_grabs(&self) -> u32 {
        self.server_grabs.get()
    }

    pub fn server_grab_depth(&self) -> u32 {
        self.server_grab_depth.get()
    }

    pub fn reparent_requests(&self) -> u32 {
        self.reparent_requests.get()
    }

    pub fn destroyed(&self) -> u32 {
        self.destroyed.get()
    }

    pub fn keyboard_grabbed(&self) -> bool {
        self.keyboard.get()
    }

    pub fn pointer_grabbed(&self) -> bool {
        self.pointer.get().is_some()
    }

    pub fn pointer_cursor(&self) -> Option<Cursor> {
        self.pointer.get()
    }

    /// Cursor of every pointer grab taken, in order
    pub fn pointer_grab_cursors(&self) -> Vec<Cursor> {
        self.pointer_grab_cursors.borrow().clone()
    }

    pub fn keyboard_grab_requests(&self) -> u32 {
        self.keyboard_grab_requests.get()
    }

    pub fn keyboard_ungrab_requests(&self) -> u32 {
        self.keyboard_ungrab_requests.get()
    }
}

impl WindowOps for FakeServer {
    fn create_frame_window(&self, screen: &ScreenInfo, border_width: u32) -> Result<Window> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let mut window = FakeWindow::child_of(screen.root());
        window.border_width = border_width;
        window.mask = Some(frame_create_mask());
        self.windows.borrow_mut().insert(id, window);
        Ok(id)
    }

    fn destroy_window(&self, window: Window) -> Result<()> {
        let mut windows = self.windows.borrow_mut();
        windows.remove(&window);
        // Children of a destroyed window go with it.
        windows.retain(|_, w| w.parent != window);
        self.destroyed.set(self.destroyed.get() + 1);
        Ok(())
    }

    fn grab_server(&self) -> Result<()> {
        self.server_grab_depth.set(self.server_grab_depth.get() + 1);
        self.server_grabs.set(self.server_grabs.get() + 1);
        Ok(())
    }

    fn ungrab_server(&self) -> Result<()> {
        self.server_grab_depth
            .set(self.server_grab_depth.get().saturating_sub(1));
        Ok(())
    }

    fn select_input(&self, window: Window, mask: EventMask) -> Result<()> {
        self.update(window, |w| w.mask = Some(mask))
    }

    fn reparent_window(&self, window: Window, parent: Window, x: i32, y: i32) -> Result<()> {
        if self.fail_reparent.get() {
            return Err(WmError::Invariant(format!("reparent of 0x{:x} refused", window)));
        }
        self.reparent_requests.set(self.reparent_requests.get() + 1);
        let (old_parent, mask) = self
            .get(window, |w| (w.parent, w.mask))
            .ok_or(WmError::NotManaged(window))?;
        self.update(window, |w| {
            w.parent = parent;
            w.x = x;
            w.y = y;
            w.mask_at_reparent = w.mask;
        })?;

        // The root selects SubstructureNotify; the client sees its own only
        // with StructureNotify selected.
        if old_parent == self.root {
            self.queue_reparent_notify(self.root, window, parent);
        }
        let structure = u32::from(EventMask::STRUCTURE_NOTIFY);
        if mask.is_some_and(|m| u32::from(m) & structure != 0) {
            self.queue_reparent_notify(window, window, parent);
        }
        Ok(())
    }

    fn raise_window(&self, window: Window) -> Result<()> {
        self.update(window, |_| ())
    }

    fn map_window(&self, window: Window) -> Result<()> {
        self.update(window, |w| w.mapped = true)
    }

    fn move_window(&self, window: Window, x: i32, y: i32) -> Result<()> {
        self.update(window, |w| {
            w.x = x;
            w.y = y;
        })
    }

    fn resize_window(&self, window: Window, width: u32, height: u32) -> Result<()> {
        self.update(window, |w| {
            w.width = width;
            w.height = height;
        })
    }

    fn set_border_width(&self, window: Window, width: u32) -> Result<()> {
        self.update(window, |w| w.border_width = width)
    }

    fn shape_from_client(&self, frame: Window, client: Window, x: i32, y: i32) -> Result<()> {
        self.update(frame, |w| w.shaped_from = Some((client, x, y)))
    }

    fn clear_shape(&self, frame: Window) -> Result<()> {
        self.update(frame, |w| w.shaped_from = None)
    }

    fn take_reparent_notify(&self, window: Window) -> Result<bool> {
        let mut queued = self.reparent_notifies.borrow_mut();
        match queued.iter().position(|n| is_own_reparent(n, window)) {
            Some(i) => {
                queued.remove(i);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl InputGrabber for FakeServer {
    fn grab_keyboard(&self, root: Window) -> Result<()> {
        assert_eq!(root, self.root);
        self.keyboard.set(true);
        self.keyboard_grab_requests
            .set(self.keyboard_grab_requests.get() + 1);
        Ok(())
    }

    fn ungrab_keyboard(&self) -> Result<()> {
        self.keyboard.set(false);
        self.keyboard_ungrab_requests
            .set(self.keyboard_ungrab_requests.get() + 1);
        Ok(())
    }

    fn grab_pointer(&self, root: Window, cursor: Cursor) -> Result<()> {
        assert_eq!(root, self.root);
        self.pointer.set(Some(cursor));
        self.pointer_grab_cursors.borrow_mut().push(cursor);
        Ok(())
    }

    fn ungrab_pointer(&self) -> Result<()> {
        self.pointer.set(None);
        Ok(())
    }
}

impl DisplayOps for FakeServer {
    fn screens(&self) -> &[ScreenInfo] {
        &self.screens
    }

    fn describe(&self) -> String {
        "fake server".to_string()
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn become_manager(&self, root: Window) -> Result<()> {
        self.managed_roots.borrow_mut().push(root);
        Ok(())
    }

    fn children(&self, root: Window) -> Result<Vec<Window>> {
        let mut children: Vec<Window> = self
            .windows
            .borrow()
            .iter()
            .filter(|(_, w)| w.parent == root)
            .map(|(&id, _)| id)
            .collect();
        children.sort_unstable();
        Ok(children)
    }

    fn window_info(&self, window: Window) -> Result<Option<WindowInfo>> {
        Ok(self.get(window, |w| WindowInfo {
            root: self.root,
            area: Geometry::new(w.x, w.y, w.width, w.height),
            override_redirect: w.override_redirect,
            viewable: w.mapped,
        }))
    }

    fn is_shaped(&self, window: Window) -> Result<bool> {
        Ok(self.get(window, |w| w.bounding_shaped).unwrap_or(false))
    }

    fn select_shape_input(&self, window: Window) -> Result<()> {
        self.update(window, |w| w.shape_selected = true)
    }

    fn configure_window(&self, window: Window, aux: &ConfigureWindowAux) -> Result<()> {
        self.update(window, |w| {
            if let Some(x) = aux.x {
                w.x = x;
            }
            if let Some(y) = aux.y {
                w.y = y;
            }
            if let Some(width) = aux.width {
                w.width = width;
            }
            if let Some(height) = aux.height {
                w.height = height;
            }
            if let Some(bw) = aux.border_width {
                w.border_width = bw;
            }
        })
    }

    fn send_configure_notify(&self, window: Window, area: Geometry) -> Result<()> {
        self.configure_notifies.borrow_mut().push((window, area));
        Ok(())
    }

    fn clear_area(&self, _window: Window) -> Result<()> {
        self.clears.set(self.clears.get() + 1);
        Ok(())
    }

    fn grab_move_button(&self, frame: Window, modifiers: u16) -> Result<()> {
        self.button_grabs.borrow_mut().insert(frame, modifiers);
        Ok(())
    }

    fn ungrab_move_button(&self, frame: Window, _modifiers: u16) -> Result<()> {
        self.button_grabs.borrow_mut().remove(&frame);
        Ok(())
    }

    fn thaw_keyboard(&self) -> Result<()> {
        self.thaws.set(self.thaws.get() + 1);
        Ok(())
    }

    fn strip_locks(&self, state: u16) -> u16 {
        state & !u16::from(ModMask::LOCK | ModMask::M2)
    }

    fn escape_keycode(&self) -> Option<Keycode> {
        Some(ESCAPE_KEYCODE)
    }

    fn busy_cursor(&self) -> Cursor {
        BUSY_CURSOR
    }
}
