//! Fiducial search and pose recovery.
//!
//! A captured image may contain the peer's frame shifted by a couple of
//! hundred pixels, lightly scaled and chromatically degraded. Recovery
//! happens in two stages:
//!
//! 1. A coarse scan finds a pixel matching the peer's top-left marker
//!    colour, verifies the full 8x8 patch (at least a quarter of the
//!    pixels must match) and confirms the other three corners at their
//!    expected relative offsets with a +-2 pixel tolerance.
//! 2. Each fiducial's centroid is computed inside a 100x100 window
//!    around its expected spot; a missing corner is extrapolated from
//!    the other three. The four centroids define a bilinear map from
//!    ideal frame coordinates to captured-image coordinates.

use crate::codec::grid::{MARKER_OFFSET, MARKER_SIZE};
use crate::codec::palette::{ColorRange, MarkerRanges};
use crate::video::{Frame, FRAME_HEIGHT, FRAME_WIDTH};

/// Minimum matching pixels for an 8x8 patch to count as a marker.
const MARKER_MATCH_MIN: usize = MARKER_SIZE * MARKER_SIZE / 4;
/// Positional slack when confirming the TR/BL/BR markers.
const NEIGHBOR_TOLERANCE: i32 = 2;
/// Edge length of the centroid search window.
const CENTROID_WINDOW: i32 = 100;

/// Horizontal distance between the TL and TR marker origins.
const DIST_X: i32 = (FRAME_WIDTH - MARKER_SIZE - 2 * MARKER_OFFSET) as i32;
/// Vertical distance between the TL and BL marker origins.
const DIST_Y: i32 = (FRAME_HEIGHT - MARKER_SIZE - 2 * MARKER_OFFSET) as i32;

/// Count how many pixels of the 8x8 patch at `(x, y)` fall in `range`.
fn patch_score(img: &Frame, x: i32, y: i32, range: &ColorRange) -> usize {
    let mut count = 0;
    for dy in 0..MARKER_SIZE as i32 {
        for dx in 0..MARKER_SIZE as i32 {
            let (px, py) = (x + dx, y + dy);
            if px < 0 || py < 0 {
                continue;
            }
            let (r, g, b) = img.rgb_at(px as usize, py as usize);
            if range.contains(r, g, b) {
                count += 1;
            }
        }
    }
    count
}

fn patch_matches(img: &Frame, x: i32, y: i32, range: &ColorRange) -> bool {
    patch_score(img, x, y, range) > MARKER_MATCH_MIN
}

/// Look for a marker patch at `(x, y)` allowing +-2 pixels of slack.
fn patch_matches_near(img: &Frame, x: i32, y: i32, range: &ColorRange) -> bool {
    for dy in -NEIGHBOR_TOLERANCE..=NEIGHBOR_TOLERANCE {
        for dx in -NEIGHBOR_TOLERANCE..=NEIGHBOR_TOLERANCE {
            if patch_matches(img, x + dx, y + dy, range) {
                return true;
            }
        }
    }
    false
}

/// Scan `img` for the peer's fiducial quadruple. On success returns the
/// captured-image coordinates of the frame's top-left corner (which may
/// be negative when the frame hangs off the capture edge).
pub fn find_frame_origin(img: &Frame, ranges: &MarkerRanges) -> Option<(i32, i32)> {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let y_max = h - FRAME_HEIGHT as i32 + MARKER_SIZE as i32;
    let x_max = w - FRAME_WIDTH as i32 + MARKER_SIZE as i32;

    for y in 0..y_max.max(0) {
        for x in 0..x_max.max(0) {
            let (r, g, b) = img.rgb_at(x as usize, y as usize);
            if !ranges.tl.contains(r, g, b) {
                continue;
            }
            if !patch_matches(img, x, y, &ranges.tl) {
                continue;
            }
            let others = [
                (DIST_X, 0, &ranges.tr),
                (0, DIST_Y, &ranges.bl),
                (DIST_X, DIST_Y, &ranges.br),
            ];
            if others
                .iter()
                .all(|(dx, dy, range)| patch_matches_near(img, x + dx, y + dy, range))
            {
                return Some((x - MARKER_OFFSET as i32, y - MARKER_OFFSET as i32));
            }
        }
    }
    None
}

/// Centroid of the pixels matching `range` inside a 100x100 window
/// centred on `(cx, cy)`. `None` when too few pixels match.
fn centroid(img: &Frame, cx: i32, cy: i32, range: &ColorRange) -> Option<(f64, f64)> {
    let half = CENTROID_WINDOW / 2;
    let mut sum_x = 0.0f64;
    let mut sum_y = 0.0f64;
    let mut count = 0usize;

    for y in (cy - half)..(cy + half) {
        for x in (cx - half)..(cx + half) {
            if x < 0 || y < 0 || x >= img.width() as i32 || y >= img.height() as i32 {
                continue;
            }
            let (r, g, b) = img.rgb_at(x as usize, y as usize);
            if range.contains(r, g, b) {
                sum_x += x as f64;
                sum_y += y as f64;
                count += 1;
            }
        }
    }

    if count < MARKER_MATCH_MIN {
        return None;
    }
    Some((sum_x / count as f64, sum_y / count as f64))
}

// ── BilinearMap ──────────────────────────────────────────────────

/// Maps ideal 640x480 frame coordinates into captured-image
/// coordinates, anchored on the four fiducial centres.
#[derive(Debug, Clone, Copy)]
pub struct BilinearMap {
    tl: (f64, f64),
    tr: (f64, f64),
    bl: (f64, f64),
    br: (f64, f64),
}

impl BilinearMap {
    /// Ideal coordinate of every marker centre along its axis.
    const MARKER_CENTER: f64 = (MARKER_OFFSET + MARKER_SIZE / 2) as f64;

    pub fn new(tl: (f64, f64), tr: (f64, f64), bl: (f64, f64), br: (f64, f64)) -> Self {
        Self { tl, tr, bl, br }
    }

    /// Map the ideal point `(u, v)` to captured-image coordinates.
    pub fn map(&self, u: f64, v: f64) -> (f64, f64) {
        let fu = (u - Self::MARKER_CENTER) / DIST_X as f64;
        let fv = (v - Self::MARKER_CENTER) / DIST_Y as f64;
        let x = self.tl.0 * (1.0 - fu) * (1.0 - fv)
            + self.tr.0 * fu * (1.0 - fv)
            + self.bl.0 * (1.0 - fu) * fv
            + self.br.0 * fu * fv;
        let y = self.tl.1 * (1.0 - fu) * (1.0 - fv)
            + self.tr.1 * fu * (1.0 - fv)
            + self.bl.1 * (1.0 - fu) * fv
            + self.br.1 * fu * fv;
        (x, y)
    }
}

/// Full pose recovery: coarse scan, centroid refinement, extrapolation
/// of missing corners.
pub fn locate(img: &Frame, ranges: &MarkerRanges) -> Option<BilinearMap> {
    let (ox, oy) = find_frame_origin(img, ranges)?;

    let half = (MARKER_SIZE / 2) as i32;
    let base_x = ox + MARKER_OFFSET as i32 + half;
    let base_y = oy + MARKER_OFFSET as i32 + half;

    let expected = [
        (base_x, base_y),
        (base_x + DIST_X, base_y),
        (base_x, base_y + DIST_Y),
        (base_x + DIST_X, base_y + DIST_Y),
    ];
    let corner_ranges = [&ranges.tl, &ranges.tr, &ranges.bl, &ranges.br];

    let mut centers: [Option<(f64, f64)>; 4] = [None; 4];
    for i in 0..4 {
        centers[i] = centroid(img, expected[i].0, expected[i].1, corner_ranges[i]);
    }

    let missing = centers.iter().filter(|c| c.is_none()).count();
    if missing == 1 {
        // Parallelogram rule: each corner is the sum of its two
        // neighbours minus the diagonally opposite corner.
        let idx = centers.iter().position(|c| c.is_none()).unwrap_or(0);
        let filled = {
            let p = |i: usize| centers[i].unwrap_or((0.0, 0.0));
            match idx {
                0 => (p(1).0 + p(2).0 - p(3).0, p(1).1 + p(2).1 - p(3).1),
                1 => (p(0).0 + p(3).0 - p(2).0, p(0).1 + p(3).1 - p(2).1),
                2 => (p(0).0 + p(3).0 - p(1).0, p(0).1 + p(3).1 - p(1).1),
                _ => (p(1).0 + p(2).0 - p(0).0, p(1).1 + p(2).1 - p(0).1),
            }
        };
        centers[idx] = Some(filled);
    } else if missing > 1 {
        // Too little colour evidence for refinement; trust the coarse
        // scan positions.
        for i in 0..4 {
            if centers[i].is_none() {
                centers[i] = Some((expected[i].0 as f64, expected[i].1 as f64));
            }
        }
    }

    Some(BilinearMap::new(
        centers[0].unwrap_or((base_x as f64, base_y as f64)),
        centers[1].unwrap_or(((base_x + DIST_X) as f64, base_y as f64)),
        centers[2].unwrap_or((base_x as f64, (base_y + DIST_Y) as f64)),
        centers[3].unwrap_or(((base_x + DIST_X) as f64, (base_y + DIST_Y) as f64)),
    ))
}
