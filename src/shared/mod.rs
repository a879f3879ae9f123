//! Types shared between the reactor and the window manager

pub mod geometry;

pub use geometry::{Geometry, Insets};
