//! Role palettes and the 16-colour data palette.
//!
//! Each peer paints its fiducials with its own colour quadruple so a
//! decoder never locks onto its own reflected frame: it always searches
//! for the *peer's* colours. Detection uses wide per-channel bands to
//! survive JPEG re-encoding and display gamma.
//!
//! Everything here is flat static data, no trait objects, no subtyping.

use std::fmt;

// ── Role ─────────────────────────────────────────────────────────

/// Which end of the tunnel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Runs the SOCKS5 listener; fiducials red/green/blue/white.
    Client,
    /// Dials the CONNECT targets; fiducials cyan/magenta/yellow/orange.
    Server,
}

impl Role {
    /// The opposite role, whose frames this peer decodes.
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    /// Fiducial colours painted by this role.
    pub fn markers(self) -> &'static MarkerColors {
        match self {
            Role::Client => &CLIENT_MARKERS,
            Role::Server => &SERVER_MARKERS,
        }
    }

    /// Detection ranges matching this role's fiducial colours.
    pub fn ranges(self) -> &'static MarkerRanges {
        match self {
            Role::Client => &CLIENT_RANGES,
            Role::Server => &SERVER_RANGES,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::LuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Role::Client),
            "server" => Ok(Role::Server),
            _ => Err(crate::error::LuxError::Other(format!(
                "unknown role {s:?} (expected \"client\" or \"server\")"
            ))),
        }
    }
}

// ── Marker colours ───────────────────────────────────────────────

/// RGB triple.
pub type Rgb = [u8; 3];

/// The four corner colours painted by one role.
#[derive(Debug, Clone, Copy)]
pub struct MarkerColors {
    pub tl: Rgb,
    pub tr: Rgb,
    pub bl: Rgb,
    pub br: Rgb,
}

pub static CLIENT_MARKERS: MarkerColors = MarkerColors {
    tl: [255, 0, 0],     // red
    tr: [0, 255, 0],     // green
    bl: [0, 0, 255],     // blue
    br: [255, 255, 255], // white
};

pub static SERVER_MARKERS: MarkerColors = MarkerColors {
    tl: [0, 255, 255],   // cyan
    tr: [255, 0, 255],   // magenta
    bl: [255, 255, 0],   // yellow
    br: [255, 165, 0],   // orange
};

// ── Detection ranges ─────────────────────────────────────────────

/// Inclusive per-channel band used to classify a pixel as marker-coloured.
#[derive(Debug, Clone, Copy)]
pub struct ColorRange {
    pub r_min: u8,
    pub r_max: u8,
    pub g_min: u8,
    pub g_max: u8,
    pub b_min: u8,
    pub b_max: u8,
}

impl ColorRange {
    /// Whether `(r, g, b)` falls inside all three bands.
    #[inline]
    pub fn contains(&self, r: u8, g: u8, b: u8) -> bool {
        r >= self.r_min
            && r <= self.r_max
            && g >= self.g_min
            && g <= self.g_max
            && b >= self.b_min
            && b <= self.b_max
    }
}

const fn range(r_min: u8, r_max: u8, g_min: u8, g_max: u8, b_min: u8, b_max: u8) -> ColorRange {
    ColorRange {
        r_min,
        r_max,
        g_min,
        g_max,
        b_min,
        b_max,
    }
}

/// Detection bands for the four corners of one role.
#[derive(Debug, Clone, Copy)]
pub struct MarkerRanges {
    pub tl: ColorRange,
    pub tr: ColorRange,
    pub bl: ColorRange,
    pub br: ColorRange,
}

pub static CLIENT_RANGES: MarkerRanges = MarkerRanges {
    tl: range(130, 255, 0, 140, 0, 140),     // red
    tr: range(0, 140, 130, 255, 0, 140),     // green
    bl: range(0, 140, 0, 140, 130, 255),     // blue
    br: range(130, 255, 130, 255, 130, 255), // white
};

pub static SERVER_RANGES: MarkerRanges = MarkerRanges {
    tl: range(0, 140, 130, 255, 130, 255),   // cyan
    tr: range(130, 255, 0, 140, 130, 255),   // magenta
    bl: range(130, 255, 130, 255, 0, 140),   // yellow
    br: range(130, 255, 100, 230, 0, 140),   // orange
};

// ── Data palette ─────────────────────────────────────────────────

/// The 16 cell colours: the colour-cube vertices, their mid-intensity
/// variants and orange. Chosen for maximal pairwise RGB distance so the
/// decoder can classify by nearest neighbour.
pub static DATA_PALETTE: [Rgb; 16] = [
    [0, 0, 0],       // 0
    [255, 0, 0],     // 1
    [0, 255, 0],     // 2
    [0, 0, 255],     // 3
    [255, 255, 0],   // 4
    [255, 0, 255],   // 5
    [0, 255, 255],   // 6
    [255, 255, 255], // 7
    [128, 0, 0],     // 8
    [0, 128, 0],     // 9
    [0, 0, 128],     // 10
    [128, 128, 0],   // 11
    [128, 0, 128],   // 12
    [0, 128, 128],   // 13
    [128, 128, 128], // 14
    [255, 128, 0],   // 15
];

/// Index of the palette entry closest to `(r, g, b)` by squared
/// Euclidean distance.
pub fn nearest_palette_index(r: u8, g: u8, b: u8) -> usize {
    let mut best = 0usize;
    let mut best_dist = i32::MAX;
    for (i, c) in DATA_PALETTE.iter().enumerate() {
        let dr = r as i32 - c[0] as i32;
        let dg = g as i32 - c[1] as i32;
        let db = b as i32 - c[2] as i32;
        let dist = dr * dr + dg * dg + db * db;
        if dist < best_dist {
            best_dist = dist;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_is_symmetric() {
        assert_eq!(Role::Client.peer(), Role::Server);
        assert_eq!(Role::Server.peer(), Role::Client);
    }

    #[test]
    fn role_parses() {
        assert_eq!("client".parse::<Role>().unwrap(), Role::Client);
        assert_eq!("server".parse::<Role>().unwrap(), Role::Server);
        assert!("master".parse::<Role>().is_err());
    }

    #[test]
    fn marker_colours_fall_in_own_ranges() {
        for (colors, ranges) in [
            (&CLIENT_MARKERS, &CLIENT_RANGES),
            (&SERVER_MARKERS, &SERVER_RANGES),
        ] {
            for (c, r) in [
                (colors.tl, ranges.tl),
                (colors.tr, ranges.tr),
                (colors.bl, ranges.bl),
                (colors.br, ranges.br),
            ] {
                assert!(r.contains(c[0], c[1], c[2]), "{c:?} not in {r:?}");
            }
        }
    }

    #[test]
    fn client_tl_not_matched_by_server_ranges() {
        let [r, g, b] = CLIENT_MARKERS.tl;
        assert!(!SERVER_RANGES.tl.contains(r, g, b));
    }

    #[test]
    fn nearest_index_exact_hits() {
        for (i, c) in DATA_PALETTE.iter().enumerate() {
            assert_eq!(nearest_palette_index(c[0], c[1], c[2]), i);
        }
    }

    #[test]
    fn nearest_index_tolerates_noise() {
        // A slightly washed-out red still classifies as red.
        assert_eq!(nearest_palette_index(230, 25, 20), 1);
        // Dim grey classifies as mid-grey, not black or white.
        assert_eq!(nearest_palette_index(120, 135, 126), 14);
    }
}
