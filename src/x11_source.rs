//! X11 Event Source
//!
//! Connects the display connection to the reactor. The connection's file
//! descriptor and the signal wakeup pipe are registered with mio; the reactor
//! blocks in `wait` only after every buffered event has been handed out.

use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::trace;
use x11rb::protocol::Event;

use crate::error::Result;
use crate::reactor::signals::SignalMailbox;
use crate::reactor::EventSource;
use crate::wm::display::{Display, DisplayOps};

const X11_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);

pub struct X11EventSource {
    display: Rc<Display>,
    poll: Poll,
    events: Events,
}

impl X11EventSource {
    pub fn new(display: Rc<Display>, signals: &SignalMailbox) -> anyhow::Result<Self> {
        let fd = display.conn().stream().as_raw_fd();
        let poll = Poll::new().context("Failed to create mio Poll")?;
        poll.registry()
            .register(&mut SourceFd(&fd), X11_TOKEN, Interest::READABLE)
            .context("Failed to register X11 FD with mio")?;
        if let Some(wake) = signals.wake_fd() {
            poll.registry()
                .register(&mut SourceFd(&wake), SIGNAL_TOKEN, Interest::READABLE)
                .context("Failed to register the signal pipe with mio")?;
        }

        Ok(Self {
            display,
            poll,
            events: Events::with_capacity(2),
        })
    }
}

impl EventSource for X11EventSource {
    type Event = Event;

    fn poll_pending(&mut self) -> Result<Option<Event>> {
        self.display.next_event()
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        // Requests issued while dispatching must reach the server before we
        // sleep on its replies.
        self.display.flush()?;

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {
                for event in self.events.iter() {
                    match event.token() {
                        SIGNAL_TOKEN => trace!("X11 wait woken by a signal"),
                        _ => trace!("X11 connection readable"),
                    }
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                trace!("X11 wait interrupted by a signal");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
