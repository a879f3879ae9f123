//! Screen Module
//!
//! Per-screen display metadata: geometry, depth, visual, colormap and the
//! Xinerama regions. Queried once while the display is opened and read-only
//! afterwards.

use tracing::{debug, info};
use x11rb::connection::Connection;
use x11rb::protocol::xinerama::ConnectionExt as _;
use x11rb::protocol::xproto::{
    Colormap, ColormapAlloc, ConnectionExt as _, Screen, VisualClass, Visualid, Window,
};

use crate::error::Result;
use crate::shared::Geometry;

/// ScreenInfo - Per-screen display state
#[derive(Debug, Clone)]
pub struct ScreenInfo {
    screen_number: usize,
    root: Window,
    rect: Geometry,
    depth: u8,
    visual: Visualid,
    colormap: Colormap,
    /// `DISPLAY=host:D.S`, for children spawned on this screen
    display_string: String,
    xinerama_active: bool,
    xinerama_areas: Vec<Geometry>,
}

impl ScreenInfo {
    /// Query everything about screen `screen_number`
    ///
    /// `xinerama_version` is the negotiated extension version, or `None` when
    /// the extension is missing.
    pub fn query<C: Connection>(
        conn: &C,
        display_name: &str,
        screen_number: usize,
        xinerama_version: Option<(u32, u32)>,
    ) -> Result<Self> {
        let screen = &conn.setup().roots[screen_number];
        info!("Initializing ScreenInfo for screen {}", screen_number);

        let mut depth = screen.root_depth;
        let mut visual = screen.root_visual;
        let mut colormap = screen.default_colormap;

        if let Some((best_depth, best_visual)) =
            select_visual(screen.root_depth, &true_color_visuals(screen))
        {
            colormap = conn.generate_id()?;
            conn.create_colormap(ColormapAlloc::NONE, colormap, screen.root, best_visual)?;
            debug!(
                "Screen {}: using TrueColor visual 0x{:x} at depth {}",
                screen_number, best_visual, best_depth
            );
            depth = best_depth;
            visual = best_visual;
        }

        let (xinerama_active, xinerama_areas) = match xinerama_version {
            Some((1, _)) => {
                let active = conn.xinerama_is_active()?.reply()?.state != 0;
                let regions = if active {
                    conn.xinerama_query_screens()?
                        .reply()?
                        .screen_info
                        .iter()
                        .map(|s| {
                            Geometry::new(s.x_org.into(), s.y_org.into(), s.width.into(), s.height.into())
                        })
                        .collect()
                } else {
                    Vec::new()
                };
                normalize_regions(active, regions)
            }
            _ => (false, Vec::new()),
        };
        if xinerama_active {
            info!(
                "Screen {}: Xinerama active with {} regions",
                screen_number,
                xinerama_areas.len()
            );
        }

        Ok(Self {
            screen_number,
            root: screen.root,
            rect: Geometry::sized(screen.width_in_pixels.into(), screen.height_in_pixels.into()),
            depth,
            visual,
            colormap,
            display_string: display_string(display_name, screen_number),
            xinerama_active,
            xinerama_areas,
        })
    }

    pub fn screen_number(&self) -> usize {
        self.screen_number
    }

    pub fn root(&self) -> Window {
        self.root
    }

    pub fn width(&self) -> u32 {
        self.rect.width
    }

    pub fn height(&self) -> u32 {
        self.rect.height
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn visual(&self) -> Visualid {
        self.visual
    }

    pub fn colormap(&self) -> Colormap {
        self.colormap
    }

    pub fn display_string(&self) -> &str {
        &self.display_string
    }

    pub fn is_xinerama_active(&self) -> bool {
        self.xinerama_active
    }

    pub fn xinerama_areas(&self) -> &[Geometry] {
        &self.xinerama_areas
    }
}

#[cfg(test)]
impl ScreenInfo {
    /// A default-visual screen with no server behind it
    pub fn synthetic(root: Window, width: u32, height: u32) -> Self {
        Self {
            screen_number: 0,
            root,
            rect: Geometry::sized(width, height),
            depth: 24,
            visual: 0x21,
            colormap: 0x20,
            display_string: display_string(":0", 0),
            xinerama_active: false,
            xinerama_areas: Vec::new(),
        }
    }
}

/// TrueColor visuals of `screen`, in server order
fn true_color_visuals(screen: &Screen) -> Vec<(u8, Visualid)> {
    screen
        .allowed_depths
        .iter()
        .flat_map(|d| {
            d.visuals
                .iter()
                .filter(|v| v.class == VisualClass::TRUE_COLOR)
                .map(move |v| (d.depth, v.visual_id))
        })
        .collect()
}

/// Pick a TrueColor visual when the default depth is below 8
///
/// Walks the candidates keeping the deepest seen so far. Once a 24-bit
/// candidate has been taken, the first deeper candidate ends the search.
/// Returns `None` to keep the default visual.
pub fn select_visual(default_depth: u8, candidates: &[(u8, Visualid)]) -> Option<(u8, Visualid)> {
    if default_depth >= 8 {
        return None;
    }

    let mut max_depth = 1;
    let mut best = None;
    for &(depth, visual) in candidates {
        if depth > max_depth {
            if max_depth == 24 && depth > 24 {
                break;
            }
            max_depth = depth;
            best = Some((depth, visual));
        }
    }

    if max_depth < default_depth {
        return None;
    }
    best
}

/// "Active" with no regions is treated as inactive
pub fn normalize_regions(active: bool, regions: Vec<Geometry>) -> (bool, Vec<Geometry>) {
    if active && !regions.is_empty() {
        (true, regions)
    } else {
        (false, Vec::new())
    }
}

/// `DISPLAY=` string for `screen_number`, replacing any screen suffix
///
/// Only a `.N` after the last `:` counts as a screen suffix, so dotted host
/// names survive.
pub fn display_string(display_name: &str, screen_number: usize) -> String {
    let base = match display_name.rfind(':') {
        Some(colon) => match display_name[colon..].rfind('.') {
            Some(dot) => &display_name[..colon + dot],
            None => display_name,
        },
        None => display_name,
    };
    format!("DISPLAY={}.{}", base, screen_number)
}
