//! Lintel
//!
//! A small reparenting X11 window manager built around a single-threaded
//! reactor: protocol events and software timers are multiplexed on the
//! display connection, and every managed window is wrapped in a frame.

mod config;
mod error;
mod reactor;
mod shared;
mod wm;
mod x11_source;

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::{FaultFlag, ProtocolErrors};
use crate::reactor::signals::SignalMailbox;
use crate::reactor::{EventHandler, LoopExit, Reactor, SystemClock};
use crate::wm::display::Display;
use crate::wm::WindowManager;
use crate::x11_source::X11EventSource;

const USAGE: &str = "usage: lintel [--display NAME] [--config PATH]";

/// Exit status when the display cannot be opened
const EXIT_NO_DISPLAY: i32 = 2;

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    display: Option<String>,
    config: Option<PathBuf>,
    help: bool,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--display" | "-d" => {
                    parsed.display = Some(args.next().context("--display needs a value")?);
                }
                "--config" | "-c" => {
                    parsed.config = Some(args.next().context("--config needs a value")?.into());
                }
                "--help" | "-h" => parsed.help = true,
                other => bail!("unknown argument {:?}", other),
            }
        }
        Ok(parsed)
    }
}

fn main() {
    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("lintel: {:#}\n{}", e, USAGE);
            std::process::exit(1);
        }
    };
    if args.help {
        println!("{}", USAGE);
        return;
    }

    let config = Config::load(args.config.as_deref());

    // Initialize logging
    let fallback_filter = config
        .as_ref()
        .map(|c| c.logging.filter.clone())
        .unwrap_or_else(|_| "lintel=info".into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or(fallback_filter),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config.unwrap_or_else(|e| {
        warn!("Using default configuration: {:#}", e);
        Config::default()
    });

    info!("Starting Lintel {}", env!("CARGO_PKG_VERSION"));

    match run(&args, config) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: &Args, config: Config) -> Result<i32> {
    let name = args.display.as_deref().or(config.display.name.as_deref());
    let display = match Display::open(name) {
        Ok(display) => Rc::new(display),
        Err(e) => {
            error!("Cannot open display: {}", e);
            return Ok(EXIT_NO_DISPLAY);
        }
    };

    let fault = FaultFlag::new();
    let errors = ProtocolErrors::new(fault.clone(), config.logging.report_protocol_errors);
    let signals = SignalMailbox::install().context("Failed to install signal handlers")?;
    let source = X11EventSource::new(Rc::clone(&display), &signals)?;

    let mut reactor = Reactor::new(source, SystemClock, signals, fault);
    let mut wm = WindowManager::new(display, &config, args.config.clone(), errors)
        .context("Failed to set up the window manager")?;

    if let Err(e) = wm.start(reactor.timers()) {
        error!("Startup failed: {}", e);
        wm.shutdown(reactor.timers());
        return Ok(1);
    }
    info!("Managing {} windows", wm.client_count());

    let exit = reactor.event_loop(&mut wm);
    debug!("Event loop left in state {:?}", reactor.state());
    match exit {
        LoopExit::Terminated(signal) => {
            info!("Terminated by {}", signal);
            Ok(0)
        }
        LoopExit::Faulted => {
            error!("Event loop stopped after an internal fault");
            Ok(1)
        }
        LoopExit::Abort(signal) => {
            error!("Aborting after {}", signal);
            std::process::abort()
        }
        LoopExit::Unrecoverable => std::process::abort(),
    }
}
