//! Events Module
//!
//! Routes protocol events to the window manager.

use std::rc::Rc;

use tracing::{debug, trace};
use x11rb::protocol::shape::SK;
use x11rb::protocol::xproto::{
    ButtonPressEvent, ConfigWindow, ConfigureRequestEvent, ConfigureWindowAux,
};
use x11rb::protocol::Event;

use crate::error::Result;
use crate::reactor::TimerQueue;
use crate::wm::display::DisplayOps;
use crate::wm::frame::WindowOps;
use crate::wm::WindowManager;

impl<D: DisplayOps + 'static> WindowManager<D> {
    pub(crate) fn handle_event(&mut self, event: Event, timers: &mut TimerQueue<Self>) -> Result<()> {
        match event {
            Event::Error(err) => self.errors.report(&err),
            Event::MapRequest(e) => {
                debug!("MapRequest: window 0x{:x}", e.window);
                match self.clients.get(&e.window) {
                    Some(client) => {
                        self.display.map_window(e.window)?;
                        if let Some(frame) = &client.frame {
                            self.display.map_window(frame.window())?;
                        }
                        Ok(())
                    }
                    None => self.manage(e.window),
                }
            }
            // Only the client's own StructureNotify counts; the copy the root
            // sees for a reparented window is not a withdrawal.
            Event::UnmapNotify(e) if e.event == e.window && self.clients.contains_key(&e.window) => {
                debug!("UnmapNotify: window 0x{:x}", e.window);
                self.unmanage(e.window, false, timers)
            }
            Event::DestroyNotify(e) if self.clients.contains_key(&e.window) => {
                debug!("DestroyNotify: window 0x{:x}", e.window);
                self.unmanage(e.window, false, timers)
            }
            Event::ConfigureRequest(e) => self.configure_request(&e),
            // Clip and input shape changes leave the frame alone.
            Event::ShapeNotify(e) if e.shape_kind == SK::BOUNDING => {
                let display = Rc::clone(&self.display);
                if let Some(client) = self.clients.get_mut(&e.affected_window) {
                    client.shaped = e.shaped;
                    if let Some(frame) = &client.frame {
                        frame.shape(&*display, client)?;
                    }
                }
                Ok(())
            }
            Event::ButtonPress(e) => self.button_press(&e, timers),
            Event::MotionNotify(e) => self.move_motion(e.root_x.into(), e.root_y.into()),
            Event::ButtonRelease(e) if e.detail == 1 => self.finish_move(timers),
            Event::KeyPress(e) => {
                if self.moving.is_some() && Some(e.detail) == self.display.escape_keycode() {
                    self.cancel_move(timers)
                } else {
                    Ok(())
                }
            }
            other => {
                trace!("Ignoring event {:?}", other);
                Ok(())
            }
        }
    }

    fn button_press(&mut self, e: &ButtonPressEvent, timers: &mut TimerQueue<Self>) -> Result<()> {
        if e.detail != 1 {
            return Ok(());
        }
        let state = self.display.strip_locks(u16::from(e.state));
        if state & self.move_modifier != self.move_modifier {
            return Ok(());
        }
        let Some(&client) = self.frames.get(&e.event) else {
            return Ok(());
        };
        self.start_move(client, e.root_x.into(), e.root_y.into(), timers)
    }

    fn configure_request(&mut self, e: &ConfigureRequestEvent) -> Result<()> {
        let mask = u16::from(e.value_mask);
        let has = |flag: ConfigWindow| mask & u16::from(flag) != 0;

        let display = Rc::clone(&self.display);
        let Some(client) = self.clients.get_mut(&e.window) else {
            // Not ours: let it through unchanged.
            let aux = ConfigureWindowAux::from_configure_request(e);
            return display.configure_window(e.window, &aux);
        };

        debug!("ConfigureRequest: managed window 0x{:x}", e.window);
        if has(ConfigWindow::X) {
            client.area.x = e.x.into();
        }
        if has(ConfigWindow::Y) {
            client.area.y = e.y.into();
        }
        if has(ConfigWindow::WIDTH) {
            client.area.width = e.width.into();
        }
        if has(ConfigWindow::HEIGHT) {
            client.area.height = e.height.into();
        }

        display.resize_window(client.window, client.area.width, client.area.height)?;
        if let Some(frame) = &client.frame {
            frame.resize(&*display, client)?;
            frame.place(&*display, client)?;
            if client.shaped {
                frame.shape(&*display, client)?;
            }
        }
        display.send_configure_notify(client.window, client.area)
    }
}
