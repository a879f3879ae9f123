//! MoveResize Module
//!
//! Interactive window moves. A move starts from a modifier+button press on a
//! frame, follows the pointer while the button is held, and ends on release.
//! Escape or the move timeout puts the window back where it started.

use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, info, warn};
use x11rb::protocol::xproto::Window;

use crate::error::Result;
use crate::reactor::{Timer, TimerId, TimerQueue};
use crate::wm::display::DisplayOps;
use crate::wm::frame::WindowOps;
use crate::wm::WindowManager;

/// Move operation state
#[derive(Debug, Clone)]
pub struct MoveState {
    /// Client being moved
    pub client: Window,
    /// Pointer position at the start, in root coordinates
    pointer_start: (i32, i32),
    /// Frame position at the start
    frame_start: (i32, i32),
    /// One-shot timer that cancels a move left running
    pub timeout: TimerId,
}

impl MoveState {
    pub fn new(client: Window, pointer_start: (i32, i32), frame_start: (i32, i32), timeout: TimerId) -> Self {
        Self {
            client,
            pointer_start,
            frame_start,
            timeout,
        }
    }

    /// Frame position for the pointer at (`root_x`, `root_y`)
    pub fn frame_position(&self, root_x: i32, root_y: i32) -> (i32, i32) {
        (
            self.frame_start.0 + root_x - self.pointer_start.0,
            self.frame_start.1 + root_y - self.pointer_start.1,
        )
    }

    pub fn origin(&self) -> (i32, i32) {
        self.frame_start
    }
}

impl<D: DisplayOps + 'static> WindowManager<D> {
    /// Begin moving `client` with the pointer at (`root_x`, `root_y`)
    pub(crate) fn start_move(
        &mut self,
        client: Window,
        root_x: i32,
        root_y: i32,
        timers: &mut TimerQueue<Self>,
    ) -> Result<()> {
        if self.moving.is_some() {
            return Ok(());
        }
        let Some(outer) = self
            .clients
            .get(&client)
            .and_then(|c| c.frame.as_ref().map(|f| f.outer_geometry(c.area)))
        else {
            return Ok(());
        };

        let display = Rc::clone(&self.display);
        self.grabs.acquire_keyboard(&*display)?;
        display.thaw_keyboard()?;

        let timeout = timers.insert(Timer::oneshot(
            Instant::now() + self.move_timeout,
            |wm: &mut WindowManager<D>, timers: &mut TimerQueue<WindowManager<D>>| {
                info!("Move timed out, cancelling");
                if let Err(e) = wm.cancel_move(timers) {
                    warn!("Failed to cancel move: {}", e);
                }
            },
        ));

        debug!("Starting move of window 0x{:x}", client);
        self.moving = Some(MoveState::new(client, (root_x, root_y), (outer.x, outer.y), timeout));
        Ok(())
    }

    /// Follow the pointer
    pub(crate) fn move_motion(&mut self, root_x: i32, root_y: i32) -> Result<()> {
        let Some(state) = &self.moving else {
            return Ok(());
        };
        let client = state.client;
        let (x, y) = state.frame_position(root_x, root_y);
        self.move_frame_to(client, x, y)
    }

    /// Keep the window where it is now
    pub(crate) fn finish_move(&mut self, timers: &mut TimerQueue<Self>) -> Result<()> {
        let Some(state) = self.moving.take() else {
            return Ok(());
        };
        debug!("Finished move of window 0x{:x}", state.client);
        self.end_move(&state, timers)?;
        if let Some(client) = self.clients.get(&state.client) {
            self.display.send_configure_notify(client.window, client.area)?;
        }
        Ok(())
    }

    /// Put the window back where the move started
    pub(crate) fn cancel_move(&mut self, timers: &mut TimerQueue<Self>) -> Result<()> {
        let Some(state) = self.moving.take() else {
            return Ok(());
        };
        debug!("Cancelled move of window 0x{:x}", state.client);
        let (x, y) = state.origin();
        self.move_frame_to(state.client, x, y)?;
        self.end_move(&state, timers)
    }

    /// Drop the timeout and the keyboard grab a move holds
    pub(crate) fn end_move(&mut self, state: &MoveState, timers: &mut TimerQueue<Self>) -> Result<()> {
        timers.remove(state.timeout);
        self.grabs.release_keyboard(&*self.display)
    }

    fn move_frame_to(&mut self, client: Window, x: i32, y: i32) -> Result<()> {
        let Some(client) = self.clients.get_mut(&client) else {
            return Ok(());
        };
        let Some(frame) = &client.frame else {
            return Ok(());
        };
        let (cx, cy) = frame.client_origin(x, y);
        self.display.move_window(frame.window(), x, y)?;
        client.area.x = cx;
        client.area.y = cy;
        Ok(())
    }
}
