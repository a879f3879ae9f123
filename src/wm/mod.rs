//! Window Manager Module
//!
//! Ties the display, the grab registry and the frames together and plugs
//! them into the reactor as its event handler.

pub mod client;
pub mod display;
pub mod events;
pub mod frame;
pub mod grab;
pub mod moveresize;
pub mod screen;
#[cfg(test)]
pub mod testing;

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};
use x11rb::protocol::xproto::Window;
use x11rb::protocol::Event;

use crate::config::Config;
use crate::error::{ProtocolErrors, Result, WmError};
use crate::reactor::{EventHandler, Timer, TimerQueue};
use crate::wm::client::Client;
use crate::wm::display::DisplayOps;
use crate::wm::frame::{Frame, Style, WindowOps};
use crate::wm::grab::GrabRegistry;
use crate::wm::moveresize::MoveState;

/// The window manager, generic over the server it talks to
pub struct WindowManager<D> {
    display: Rc<D>,
    /// Config file re-read on SIGHUP
    config_path: Option<PathBuf>,
    style: Style,
    move_modifier: u16,
    move_timeout: Duration,
    health_interval: Option<Duration>,
    grabs: GrabRegistry,
    errors: ProtocolErrors,
    /// Managed clients by client window
    clients: HashMap<Window, Client>,
    /// Client window by frame window
    frames: HashMap<Window, Window>,
    moving: Option<MoveState>,
}

impl<D: DisplayOps + 'static> WindowManager<D> {
    pub fn new(
        display: Rc<D>,
        config: &Config,
        config_path: Option<PathBuf>,
        errors: ProtocolErrors,
    ) -> Result<Self> {
        let root = display
            .screen_info(0)
            .map(|s| s.root())
            .ok_or_else(|| WmError::Invariant("display has no screens".into()))?;
        let move_modifier = config
            .behavior
            .move_modifier_mask()
            .map_err(|e| WmError::Invariant(e.to_string()))?;

        Ok(Self {
            display,
            config_path,
            style: config.style.to_style(),
            move_modifier,
            move_timeout: config.behavior.move_timeout(),
            health_interval: config.behavior.health_interval(),
            grabs: GrabRegistry::new(root),
            errors,
            clients: HashMap::new(),
            frames: HashMap::new(),
            moving: None,
        })
    }

    /// Take over every screen, adopt existing windows and arm the health timer
    pub fn start(&mut self, timers: &mut TimerQueue<Self>) -> Result<()> {
        let display = Rc::clone(&self.display);
        for screen in display.screens() {
            display.become_manager(screen.root())?;
            info!(
                "WM: Managing screen {} ({}x{}, depth {})",
                screen.screen_number(),
                screen.width(),
                screen.height(),
                screen.depth()
            );
            for window in display.children(screen.root())? {
                if let Some(info) = display.window_info(window)? {
                    if info.viewable && !info.override_redirect {
                        self.manage(window)?;
                    }
                }
            }
        }

        if let Some(interval) = self.health_interval {
            timers.insert(Timer::recurring(
                Instant::now() + interval,
                interval,
                |wm: &mut WindowManager<D>, timers: &mut TimerQueue<WindowManager<D>>| {
                    info!(
                        "Health: {} clients managed, {} protocol errors, {} timers pending",
                        wm.clients.len(),
                        wm.errors.count(),
                        timers.len()
                    );
                },
            ));
        }

        display.flush()
    }

    /// Wrap `window` in a frame
    pub fn manage(&mut self, window: Window) -> Result<()> {
        if self.clients.contains_key(&window) || self.frames.contains_key(&window) {
            return Ok(());
        }

        let display = Rc::clone(&self.display);
        let Some(info) = display.window_info(window)? else {
            debug!("WM: Window 0x{:x} vanished before it could be managed", window);
            return Ok(());
        };
        if info.override_redirect {
            return Ok(());
        }
        let screen = display
            .screen_for_root(info.root)
            .ok_or_else(|| WmError::Invariant(format!("unknown root 0x{:x}", info.root)))?;

        let shaped = display.is_shaped(window)?;
        display.select_shape_input(window)?;

        let mut client = Client::new(window, info.area, shaped, screen.screen_number());
        let frame = Frame::new(&*display, screen, &client, self.style)?;
        frame.place(&*display, &client)?;
        display.map_window(frame.window())?;
        display.grab_move_button(frame.window(), self.move_modifier)?;

        info!(
            "WM: Managing window 0x{:x} in frame 0x{:x} at {}x{}+{}+{}",
            window,
            frame.window(),
            client.area.width,
            client.area.height,
            client.area.x,
            client.area.y
        );
        self.frames.insert(frame.window(), window);
        client.frame = Some(frame);
        self.clients.insert(window, client);
        Ok(())
    }

    /// Give `window` back to the root and destroy its frame
    ///
    /// A move of the window in progress ends with it.
    pub fn unmanage(&mut self, window: Window, remap: bool, timers: &mut TimerQueue<Self>) -> Result<()> {
        let mut client = self
            .clients
            .remove(&window)
            .ok_or(WmError::NotManaged(window))?;

        if let Some(state) = self.moving.take_if(|m| m.client == window) {
            debug!("Window 0x{:x} left while being moved", window);
            self.end_move(&state, timers)?;
        }

        let display = Rc::clone(&self.display);
        if let Some(mut frame) = client.frame.take() {
            self.frames.remove(&frame.window());
            display.ungrab_move_button(frame.window(), self.move_modifier)?;
            let released = frame.release(&*display, &client, remap);
            display.destroy_window(frame.window())?;
            released?;
        }
        info!("WM: Unmanaged window 0x{:x}", window);
        Ok(())
    }

    /// Apply `style` to every frame, keeping clients where they are
    pub fn apply_style(&mut self, style: Style) -> Result<()> {
        self.style = style;
        let display = Rc::clone(&self.display);
        for client in self.clients.values_mut() {
            let Some(mut frame) = client.frame.take() else {
                continue;
            };
            let result = restyle(&*display, &mut frame, client, style);
            client.frame = Some(frame);
            result?;
        }
        Ok(())
    }

    /// Re-read the style from the config file
    fn reload_style(&mut self) -> Result<()> {
        let config = match Config::load(self.config_path.as_deref()) {
            Ok(config) => config,
            Err(e) => {
                warn!("Keeping the current style: {:#}", e);
                return Ok(());
            }
        };
        info!("Reloading style: {:?}", config.style);

        let display = Rc::clone(&self.display);
        self.grabs.acquire_pointer(&*display, display.busy_cursor())?;
        let result = self.apply_style(config.style.to_style());
        self.grabs.release_pointer(&*display)?;
        result
    }

    fn log_summary(&self) {
        info!(
            "WM: {} clients managed, keyboard grabs {}, pointer grabs {}, {} protocol errors, moving {:?}",
            self.clients.len(),
            self.grabs.keyboard_depth(),
            self.grabs.pointer_depth(),
            self.errors.count(),
            self.moving.as_ref().map(|m| m.client)
        );
        info!("WM: {}", self.display.describe());
        for screen in self.display.screens() {
            info!(
                "WM: Screen {} root 0x{:x} {} xinerama {} regions {:?}",
                screen.screen_number(),
                screen.root(),
                screen.display_string(),
                if screen.is_xinerama_active() { "active" } else { "inactive" },
                screen.xinerama_areas()
            );
        }
        for client in self.clients.values() {
            debug!(
                "WM:   client 0x{:x} screen {} frame {:?} area {:?} shaped {}",
                client.window,
                client.screen,
                client.frame.as_ref().map(|f| (f.window(), f.state())),
                client.area,
                client.shaped
            );
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

fn restyle<D: DisplayOps>(display: &D, frame: &mut Frame, client: &Client, style: Style) -> Result<()> {
    if frame.style() == style {
        return Ok(());
    }
    frame.set_style(display, client, style)?;
    frame.place(display, client)?;
    if frame.take_redraw() {
        display.clear_area(frame.window())?;
    }
    Ok(())
}

impl<D: DisplayOps + 'static> EventHandler for WindowManager<D> {
    type Event = Event;

    fn dispatch(&mut self, event: Event, timers: &mut TimerQueue<Self>) -> Result<()> {
        self.handle_event(event, timers)
    }

    fn handle_signal(&mut self, signal: Signal, _timers: &mut TimerQueue<Self>) -> bool {
        match signal {
            Signal::SIGHUP => {
                if let Err(e) = self.reload_style() {
                    warn!("Style reload failed: {}", e);
                }
                true
            }
            Signal::SIGUSR1 => {
                self.log_summary();
                true
            }
            Signal::SIGUSR2 => {
                let verbose = self.errors.toggle_verbose();
                info!("Protocol error reporting {}", if verbose { "on" } else { "off" });
                true
            }
            _ => false,
        }
    }

    fn shutdown(&mut self, timers: &mut TimerQueue<Self>) {
        let mut windows: Vec<Window> = self.clients.keys().copied().collect();
        windows.sort_unstable();
        for window in windows {
            if let Err(e) = self.unmanage(window, true, timers) {
                warn!("Failed to release window 0x{:x}: {}", window, e);
            }
        }
        if let Some(state) = self.moving.take() {
            timers.remove(state.timeout);
        }
        self.grabs.shutdown(&*self.display);
        if let Err(e) = self.display.flush() {
            warn!("Failed to flush during shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use x11rb::protocol::xproto::{ButtonPressEvent, KeyButMask, ModMask};

    use super::*;
    use crate::shared::Geometry;
    use crate::wm::testing::{manager, manager_with_config, FakeServer, BUSY_CURSOR, ROOT};

    const CLIENT: Window = 0x400001;
    const OTHER: Window = 0x400002;

    fn server_with_clients() -> Rc<FakeServer> {
        let server = Rc::new(FakeServer::new(ROOT));
        server.add_client(CLIENT, Geometry::new(100, 80, 300, 200), false);
        server.add_client(OTHER, Geometry::new(600, 400, 200, 100), false);
        server
    }

    #[test]
    fn start_adopts_viewable_top_level_windows() {
        let server = server_with_clients();
        server.add_client(0x400003, Geometry::new(0, 0, 40, 40), true);
        server.add_client(0x400004, Geometry::new(0, 0, 40, 40), false);
        server.unmap(0x400004);
        let mut wm = manager(&server);
        let mut timers = TimerQueue::new();

        wm.start(&mut timers).unwrap();

        assert_eq!(server.managed_roots(), vec![ROOT]);
        assert_eq!(wm.client_count(), 2);
        assert_ne!(server.parent_of(CLIENT), Some(ROOT));
        assert_ne!(server.parent_of(OTHER), Some(ROOT));
        assert_eq!(server.parent_of(0x400003), Some(ROOT));
        assert_eq!(server.parent_of(0x400004), Some(ROOT));
        // The health report is the only timer armed at startup.
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn shutdown_hands_every_client_back_mapped() {
        let server = server_with_clients();
        let mut wm = manager(&server);
        let mut timers = TimerQueue::new();
        wm.manage(CLIENT).unwrap();
        wm.manage(OTHER).unwrap();
        let frames = [
            server.parent_of(CLIENT).unwrap(),
            server.parent_of(OTHER).unwrap(),
        ];
        // Withdrawn by the user but still managed when the WM goes away.
        server.unmap(OTHER);

        wm.shutdown(&mut timers);

        assert_eq!(wm.client_count(), 0);
        for window in [CLIENT, OTHER] {
            assert_eq!(server.parent_of(window), Some(ROOT));
            assert!(server.is_mapped(window));
        }
        assert_eq!(server.position_of(OTHER), Some((600, 400)));
        for frame in frames {
            assert!(!server.exists(frame));
        }
    }

    #[test]
    fn shutdown_during_a_move_drops_its_grab_and_timeout() {
        let server = server_with_clients();
        let mut wm = manager(&server);
        let mut timers = TimerQueue::new();
        wm.manage(CLIENT).unwrap();
        let frame = server.parent_of(CLIENT).unwrap();
        let press = Event::ButtonPress(ButtonPressEvent {
            detail: 1,
            root: ROOT,
            event: frame,
            root_x: 150,
            root_y: 150,
            state: KeyButMask::from(u16::from(ModMask::M1)),
            ..Default::default()
        });
        wm.dispatch(press, &mut timers).unwrap();
        assert!(server.keyboard_grabbed());

        wm.shutdown(&mut timers);

        assert!(timers.is_empty());
        assert!(!server.keyboard_grabbed());
        assert_eq!(wm.grabs.keyboard_depth(), 0);
        assert_eq!(server.parent_of(CLIENT), Some(ROOT));
    }

    #[test]
    fn sighup_reloads_the_style_under_a_busy_pointer() {
        let dir = std::env::temp_dir().join(format!("lintel-reload-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        fs::write(
            &path,
            "[style]\nborder_width = 3\nmargin = 4\ntitle_height = 20\n",
        )
        .unwrap();

        let server = server_with_clients();
        let mut wm = manager_with_config(&server, Some(path));
        let mut timers = TimerQueue::new();
        wm.manage(CLIENT).unwrap();
        let frame = server.parent_of(CLIENT).unwrap();

        assert!(wm.handle_signal(Signal::SIGHUP, &mut timers));

        assert_eq!(server.border_width_of(frame), Some(3));
        assert_eq!(server.size_of(frame), Some((308, 228)));
        assert_eq!(server.position_of(frame), Some((93, 53)));
        assert_eq!(server.position_of(CLIENT), Some((4, 24)));
        assert_eq!(server.clears(), 1);
        assert_eq!(server.pointer_grab_cursors(), vec![BUSY_CURSOR]);
        assert!(!server.pointer_grabbed());
        assert_eq!(wm.grabs.pointer_depth(), 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unreadable_config_keeps_the_current_style() {
        let dir = std::env::temp_dir().join(format!("lintel-bad-reload-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        fs::write(&path, "[style\n").unwrap();

        let server = server_with_clients();
        let mut wm = manager_with_config(&server, Some(path));
        wm.manage(CLIENT).unwrap();
        let frame = server.parent_of(CLIENT).unwrap();

        assert!(wm.handle_signal(Signal::SIGHUP, &mut TimerQueue::new()));

        assert_eq!(server.size_of(frame), Some((304, 204)));
        assert_eq!(server.clears(), 0);
        assert!(server.pointer_grab_cursors().is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn reapplying_the_same_style_leaves_frames_alone() {
        let server = server_with_clients();
        let mut wm = manager(&server);
        wm.manage(CLIENT).unwrap();

        wm.apply_style(Style::default()).unwrap();

        assert_eq!(server.clears(), 0);
    }

    #[test]
    fn unhandled_signals_are_left_to_the_reactor() {
        let server = server_with_clients();
        let mut wm = manager(&server);
        let mut timers = TimerQueue::new();

        assert!(wm.handle_signal(Signal::SIGUSR1, &mut timers));
        assert!(wm.handle_signal(Signal::SIGUSR2, &mut timers));
        assert!(!wm.handle_signal(Signal::SIGTERM, &mut timers));
    }
}
