//! The visual codec: lossless round-trip of a byte buffer through one
//! 640x480 RGBA frame.
//!
//! ## Frame anatomy
//!
//! ```text
//! [TL]· · · · · · ruler · · · · · ·[TR]      [..] 8x8 fiducial, inset 4
//!  ·  #  <- 4x4 block-size tag                #   tag at (16, 4)
//!  r                                          r   vertical ruler (x=1)
//!  u   cell grid: block_size-pixel            ·   horizontal ruler (y=1)
//!  l   squares, one palette nibble
//!  e   each, raster order
//! [BL]                              [BR]
//! ```
//!
//! ## Byte pipeline
//!
//! `[0x04][len u16 BE][payload][crc32 BE]` -> RS(255, 223) -> XOR 0xAA
//! -> MSB-first bits -> 4-bit nibbles -> palette cells. The decoder
//! reverses the pipeline after recovering the pose from the fiducials
//! and the cell size from the tag.

pub mod detect;
pub mod gf256;
pub mod grid;
pub mod palette;
pub mod rs;

pub use grid::{max_payload, DEFAULT_BLOCK_SIZE};
pub use palette::Role;

use crate::error::LuxError;
use crate::video::{Frame, FRAME_HEIGHT, FRAME_WIDTH};
use grid::{CellGrid, MARKER_OFFSET, MARKER_SIZE, MIN_BLOCK_SIZE};
use palette::{nearest_palette_index, DATA_PALETTE};

/// Format byte at the head of every framed block.
const FORMAT_VERSION: u8 = 0x04;
/// XOR mask that breaks long same-colour runs for the lossy transport.
const SCRAMBLE_MASK: u8 = 0xAA;
/// Version byte + 2 length bytes + 4 CRC bytes.
const FRAME_OVERHEAD: usize = 7;
/// Sanity cap on the per-frame payload length during decode.
const MAX_FRAME_PAYLOAD: usize = 16384;

/// Top-left corner of the block-size tag.
const TAG_X: usize = 16;
const TAG_Y: usize = 4;
/// Edge length of the block-size tag.
const TAG_SIZE: usize = 4;

/// Rulers start this far from the nearest frame corner.
const RULER_INSET: usize = 64;

// ── Encoding ─────────────────────────────────────────────────────

/// Pack `payload` into one frame using the `role`'s fiducial colours.
///
/// `block_size` is a request: when the payload does not fit at that
/// cell size it is stepped down to the largest size that fits (but
/// never below 2). The effective size is written into the tag so the
/// decoder is self-sufficient.
pub fn encode(
    payload: &[u8],
    margin: usize,
    block_size: usize,
    role: Role,
) -> Result<Frame, LuxError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(LuxError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }

    // Framed block: version, length, payload, CRC-32/IEEE of the rest.
    let mut framed = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    framed.push(FORMAT_VERSION);
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    let crc = crc32fast::hash(&framed);
    framed.extend_from_slice(&crc.to_be_bytes());

    let mut coded = rs::encode(&framed);
    for b in coded.iter_mut() {
        *b ^= SCRAMBLE_MASK;
    }

    let total_bits = coded.len() * 8;
    let block = grid::fit_block_size(total_bits, margin, block_size);
    if total_bits > grid::max_bits(margin, block) {
        return Err(LuxError::PayloadTooLarge {
            size: payload.len(),
            max: grid::max_payload(margin, MIN_BLOCK_SIZE),
        });
    }
    if block != block_size {
        tracing::debug!(
            requested = block_size,
            effective = block,
            bits = total_bits,
            "auto-adjusted cell size to fit payload"
        );
    }

    let mut img = Frame::new(FRAME_WIDTH, FRAME_HEIGHT);
    draw_fiducials(&mut img, role);
    draw_block_size_tag(&mut img, block);
    draw_rulers(&mut img);

    // Payload cells: one nibble per cell, MSB-first within each byte.
    let mut bit_idx = 0usize;
    for (x, y) in CellGrid::new(margin, block) {
        if bit_idx >= total_bits {
            break;
        }
        let mut nibble = 0usize;
        for i in 0..grid::BITS_PER_CELL {
            let idx = bit_idx + i;
            if idx < total_bits && (coded[idx / 8] >> (7 - idx % 8)) & 1 == 1 {
                nibble |= 1 << (grid::BITS_PER_CELL - 1 - i);
            }
        }
        img.fill_rect(x, y, block, block, DATA_PALETTE[nibble]);
        bit_idx += grid::BITS_PER_CELL;
    }

    Ok(img)
}

/// The frame published when there is nothing to say: fiducials, rulers
/// and tag only, with an empty payload. Keeps the peer's tracker locked
/// while clearing any retained image.
pub fn idle_frame(margin: usize, role: Role) -> Frame {
    // An empty payload always fits; fall back to a bare frame if not.
    encode(&[], margin, DEFAULT_BLOCK_SIZE, role)
        .unwrap_or_else(|_| Frame::new(FRAME_WIDTH, FRAME_HEIGHT))
}

fn draw_fiducials(img: &mut Frame, role: Role) {
    let m = role.markers();
    let far_x = FRAME_WIDTH - MARKER_SIZE - MARKER_OFFSET;
    let far_y = FRAME_HEIGHT - MARKER_SIZE - MARKER_OFFSET;
    img.fill_rect(MARKER_OFFSET, MARKER_OFFSET, MARKER_SIZE, MARKER_SIZE, m.tl);
    img.fill_rect(far_x, MARKER_OFFSET, MARKER_SIZE, MARKER_SIZE, m.tr);
    img.fill_rect(MARKER_OFFSET, far_y, MARKER_SIZE, MARKER_SIZE, m.bl);
    img.fill_rect(far_x, far_y, MARKER_SIZE, MARKER_SIZE, m.br);
}

fn draw_block_size_tag(img: &mut Frame, block: usize) {
    let idx = (block - MIN_BLOCK_SIZE).min(DATA_PALETTE.len() - 1);
    img.fill_rect(TAG_X, TAG_Y, TAG_SIZE, TAG_SIZE, DATA_PALETTE[idx]);
}

/// Alternating black/white stripes along the top row and left column,
/// 8-pixel period, skipping the corners.
fn draw_rulers(img: &mut Frame) {
    for x in (RULER_INSET..FRAME_WIDTH - RULER_INSET).step_by(8) {
        let c = if (x / 8) % 2 == 0 {
            [0, 0, 0]
        } else {
            [255, 255, 255]
        };
        img.fill_rect(x, 1, 4, 2, c);
    }
    for y in (RULER_INSET..FRAME_HEIGHT - RULER_INSET).step_by(8) {
        let c = if (y / 8) % 2 == 0 {
            [0, 0, 0]
        } else {
            [255, 255, 255]
        };
        img.fill_rect(1, y, 2, 4, c);
    }
}

// ── Decoding ─────────────────────────────────────────────────────

/// Recover the payload from a captured image.
///
/// `role` is the *local* role: the decoder searches for the peer's
/// fiducial colours. Any failure (no fiducials, uncorrectable blocks,
/// CRC mismatch) is an error; the frame simply carries no data for us.
pub fn decode(img: &Frame, margin: usize, role: Role) -> Result<Vec<u8>, LuxError> {
    let ranges = role.peer().ranges();
    let map = detect::locate(img, ranges).ok_or(LuxError::NoSignal)?;

    let block = read_block_size_tag(img, &map);

    // Walk the same grid as the encoder, classifying each cell.
    let sample_radius: i32 = if block < 6 { 1 } else { 2 };
    let mut bits: Vec<bool> = Vec::with_capacity(grid::max_bits(margin, block));
    for (x, y) in CellGrid::new(margin, block) {
        let cu = x as f64 + block as f64 / 2.0;
        let cv = y as f64 + block as f64 / 2.0;

        let mut sum = [0u32; 3];
        let mut points = 0u32;
        for dy in -sample_radius..=sample_radius {
            for dx in -sample_radius..=sample_radius {
                let (px, py) = map.map(cu + dx as f64, cv + dy as f64);
                if px < 0.0 || py < 0.0 {
                    continue;
                }
                let (px, py) = (px as usize, py as usize);
                if px >= img.width() || py >= img.height() {
                    continue;
                }
                let (r, g, b) = img.rgb_at(px, py);
                sum[0] += r as u32;
                sum[1] += g as u32;
                sum[2] += b as u32;
                points += 1;
            }
        }

        let idx = if points > 0 {
            nearest_palette_index(
                (sum[0] / points) as u8,
                (sum[1] / points) as u8,
                (sum[2] / points) as u8,
            )
        } else {
            0
        };
        for i in 0..grid::BITS_PER_CELL {
            bits.push((idx >> (grid::BITS_PER_CELL - 1 - i)) & 1 == 1);
        }
    }

    // Regroup into bytes and unscramble.
    let mut coded = Vec::with_capacity(bits.len() / 8);
    for chunk in bits.chunks_exact(8) {
        let mut b = 0u8;
        for (j, &bit) in chunk.iter().enumerate() {
            if bit {
                b |= 1 << (7 - j);
            }
        }
        coded.push(b ^ SCRAMBLE_MASK);
    }

    if coded.len() < rs::BLOCK_LEN {
        return Err(LuxError::NoSignal);
    }

    // First block tells us the payload length, and from it the total
    // RS-encoded span to decode.
    let first = rs::decode(&coded[..rs::BLOCK_LEN])?;
    if first[0] != FORMAT_VERSION {
        return Err(LuxError::InvalidFrameHeader("bad format version"));
    }
    let data_len = u16::from_be_bytes([first[1], first[2]]) as usize;
    if data_len > MAX_FRAME_PAYLOAD {
        return Err(LuxError::InvalidFrameHeader("payload length out of range"));
    }

    let rs_blocks = (data_len + FRAME_OVERHEAD).div_ceil(rs::DATA_LEN);
    let total = rs_blocks * rs::BLOCK_LEN;
    if coded.len() < total {
        return Err(LuxError::InvalidFrameHeader("frame shorter than declared"));
    }

    let decoded = rs::decode(&coded[..total])?;
    if decoded.len() < 3 + data_len + 4 {
        return Err(LuxError::InvalidFrameHeader("truncated framed block"));
    }

    let expected = u32::from_be_bytes([
        decoded[3 + data_len],
        decoded[4 + data_len],
        decoded[5 + data_len],
        decoded[6 + data_len],
    ]);
    if crc32fast::hash(&decoded[..3 + data_len]) != expected {
        return Err(LuxError::ChecksumMismatch);
    }

    Ok(decoded[3..3 + data_len].to_vec())
}

/// Sample the 4x4 tag through the pose map and translate its colour
/// back into a cell size. Out-of-range tags fall back to the default.
fn read_block_size_tag(img: &Frame, map: &detect::BilinearMap) -> usize {
    let mut sum = [0u32; 3];
    let mut points = 0u32;
    for dy in 0..TAG_SIZE {
        for dx in 0..TAG_SIZE {
            let (px, py) = map.map((TAG_X + dx) as f64 + 0.5, (TAG_Y + dy) as f64 + 0.5);
            if px < 0.0 || py < 0.0 {
                continue;
            }
            let (px, py) = (px as usize, py as usize);
            if px >= img.width() || py >= img.height() {
                continue;
            }
            let (r, g, b) = img.rgb_at(px, py);
            sum[0] += r as u32;
            sum[1] += g as u32;
            sum[2] += b as u32;
            points += 1;
        }
    }
    if points == 0 {
        return DEFAULT_BLOCK_SIZE;
    }

    let idx = nearest_palette_index(
        (sum[0] / points) as u8,
        (sum[1] / points) as u8,
        (sum[2] / points) as u8,
    );
    let block = idx + MIN_BLOCK_SIZE;
    if block > grid::MAX_BLOCK_SIZE {
        DEFAULT_BLOCK_SIZE
    } else {
        block
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{CAPTURE_HEIGHT, CAPTURE_WIDTH};

    /// Embed an encoded frame into a larger capture at `(ox, oy)`,
    /// simulating what the screen grabber hands the dispatcher.
    fn capture_with_offset(frame: &Frame, ox: usize, oy: usize) -> Frame {
        let mut capture = Frame::new(CAPTURE_WIDTH, CAPTURE_HEIGHT);
        for y in 0..frame.height() {
            for x in 0..frame.width() {
                let (r, g, b) = frame.rgb_at(x, y);
                capture.set_rgb(ox + x, oy + y, [r, g, b]);
            }
        }
        capture
    }

    #[test]
    fn smoke_roundtrip() {
        let payload: &[u8] =
            b"Hello, video stream! This is a test message to see if encoding and decoding works correctly.";
        let img = encode(payload, 10, 4, Role::Client).unwrap();
        assert_eq!(img.width(), FRAME_WIDTH);
        assert_eq!(img.height(), FRAME_HEIGHT);

        let decoded = decode(&img, 10, Role::Server).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn roundtrip_across_block_sizes() {
        for block in [4usize, 6, 8, 12] {
            let payload =
                format!("Test message for cell size {block}. This should survive any legal size.");
            let img = encode(payload.as_bytes(), 10, block, Role::Client).unwrap();
            let decoded = decode(&img, 10, Role::Server).unwrap();
            assert_eq!(decoded, payload.as_bytes(), "block = {block}");
        }
    }

    #[test]
    fn roundtrip_in_both_directions() {
        let payload = b"server to client direction";
        let img = encode(payload, 10, 4, Role::Server).unwrap();
        let decoded = decode(&img, 10, Role::Client).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn auto_adjusts_block_size_for_large_payload() {
        // 5000 bytes cannot fit at cell size 12; the encoder steps down
        // and the tag lets the decoder recover regardless.
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let img = encode(&payload, 10, 12, Role::Client).unwrap();
        let decoded = decode(&img, 10, Role::Server).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn capacity_payload_roundtrips() {
        let max = max_payload(10, 4);
        assert!(max > 4096);
        let payload: Vec<u8> = (0..max).map(|i| (i * 31) as u8).collect();
        let img = encode(&payload, 10, 4, Role::Client).unwrap();
        let decoded = decode(&img, 10, Role::Server).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        assert!(matches!(
            encode(&payload, 10, 4, Role::Client),
            Err(LuxError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn empty_payload_roundtrips() {
        let img = encode(&[], 10, 4, Role::Client).unwrap();
        let decoded = decode(&img, 10, Role::Server).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn decode_survives_capture_offset() {
        let payload = b"shifted by a screen-coordinate offset";
        let img = encode(payload, 10, 4, Role::Client).unwrap();
        let capture = capture_with_offset(&img, 173, 89);
        let decoded = decode(&capture, 10, Role::Server).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn decode_survives_byte_damage() {
        // Scribble over a few data-bearing cells near the top of the
        // grid; RS absorbs the corruption.
        let payload = b"damage tolerance check";
        let mut img = encode(payload, 10, 4, Role::Client).unwrap();
        img.fill_rect(100, 14, 8, 4, [13, 200, 77]);
        let decoded = decode(&img, 10, Role::Server).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn decoder_ignores_own_role_frames() {
        let img = encode(b"echo", 10, 4, Role::Client).unwrap();
        // A client decoding its own reflection must see nothing.
        assert!(matches!(
            decode(&img, 10, Role::Client),
            Err(LuxError::NoSignal)
        ));
    }

    #[test]
    fn blank_image_decodes_to_nothing() {
        let img = Frame::new(CAPTURE_WIDTH, CAPTURE_HEIGHT);
        assert!(matches!(
            decode(&img, 10, Role::Server),
            Err(LuxError::NoSignal)
        ));
    }

    #[test]
    fn marker_pixels_match_role_palette() {
        let img = encode(b"test", 0, 4, Role::Client).unwrap();
        assert_eq!(img.rgb_at(4, 4), (255, 0, 0));
        assert_eq!(img.rgb_at(FRAME_WIDTH - 12, 4), (0, 255, 0));
        assert_eq!(img.rgb_at(4, FRAME_HEIGHT - 12), (0, 0, 255));
        assert_eq!(img.rgb_at(FRAME_WIDTH - 12, FRAME_HEIGHT - 12), (255, 255, 255));

        let img = encode(b"test", 0, 4, Role::Server).unwrap();
        assert_eq!(img.rgb_at(4, 4), (0, 255, 255));
        assert_eq!(img.rgb_at(FRAME_WIDTH - 12, 4), (255, 0, 255));
        assert_eq!(img.rgb_at(4, FRAME_HEIGHT - 12), (255, 255, 0));
        assert_eq!(img.rgb_at(FRAME_WIDTH - 12, FRAME_HEIGHT - 12), (255, 165, 0));
    }

    #[test]
    fn tag_encodes_effective_block_size() {
        let img = encode(b"tiny", 10, 6, Role::Client).unwrap();
        // Cell size 6 -> palette index 4 (yellow).
        assert_eq!(img.rgb_at(TAG_X, TAG_Y), (255, 255, 0));
        assert_eq!(img.rgb_at(TAG_X + 3, TAG_Y + 3), (255, 255, 0));
    }

    #[test]
    fn idle_frame_carries_empty_payload() {
        let img = idle_frame(10, Role::Server);
        let decoded = decode(&img, 10, Role::Client).unwrap();
        assert!(decoded.is_empty());
    }
}
