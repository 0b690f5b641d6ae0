//! Systematic Reed-Solomon RS(255, 223) over GF(256).
//!
//! Every 223-byte chunk of input becomes a 255-byte block carrying 32
//! parity bytes, correcting up to 16 byte errors per block. The decoder
//! runs the full pipeline: syndrome computation, Berlekamp-Massey for
//! the error locator, Chien search for the error positions and Forney's
//! algorithm for the magnitudes.

use crate::codec::gf256::{self, GF_EXP};
use crate::error::LuxError;

/// Total block length on the visual channel.
pub const BLOCK_LEN: usize = 255;
/// Data bytes carried per block.
pub const DATA_LEN: usize = 223;
/// Parity bytes appended per block.
pub const PARITY_LEN: usize = 32;

/// Build the generator polynomial `g(x) = (x - a^0)(x - a^1)...(x - a^31)`.
fn generator() -> Vec<u8> {
    let mut g = vec![1u8];
    for i in 0..PARITY_LEN {
        g = gf256::poly_mul(&g, &[1, GF_EXP[i]]);
    }
    g
}

/// Encode `data` into a sequence of 255-byte blocks.
///
/// The final chunk is zero-padded to 223 bytes, so the output length is
/// always a multiple of [`BLOCK_LEN`]. Encoding is systematic: the data
/// bytes appear unchanged at the front of each block.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let gen = generator();
    let mut out = Vec::with_capacity(data.len().div_ceil(DATA_LEN) * BLOCK_LEN);

    for chunk in data.chunks(DATA_LEN) {
        let mut block = [0u8; BLOCK_LEN];
        block[..chunk.len()].copy_from_slice(chunk);

        // Polynomial long division: the block buffer holds the running
        // remainder of data(x) * x^32 / g(x).
        for j in 0..DATA_LEN {
            let coef = block[j];
            if coef != 0 {
                for (k, &g) in gen.iter().enumerate().skip(1) {
                    block[j + k] ^= gf256::mul(g, coef);
                }
            }
        }

        // Restore the systematic data part over the division scratch.
        block[..chunk.len()].copy_from_slice(chunk);
        for b in block.iter_mut().take(DATA_LEN).skip(chunk.len()) {
            *b = 0;
        }
        out.extend_from_slice(&block);
    }
    out
}

/// Decode a sequence of 255-byte blocks, returning the 223-byte data
/// parts concatenated.
///
/// Fails if `data` is not a whole number of blocks or if any block has
/// more errors than the code can correct.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, LuxError> {
    if data.is_empty() || data.len() % BLOCK_LEN != 0 {
        return Err(LuxError::InvalidFrameHeader("partial RS block"));
    }

    let mut out = Vec::with_capacity(data.len() / BLOCK_LEN * DATA_LEN);
    for (i, chunk) in data.chunks(BLOCK_LEN).enumerate() {
        let mut block = [0u8; BLOCK_LEN];
        block.copy_from_slice(chunk);
        correct_block(&mut block).map_err(|_| LuxError::Uncorrectable(i * BLOCK_LEN))?;
        out.extend_from_slice(&block[..DATA_LEN]);
    }
    Ok(out)
}

// ── Decoder internals ────────────────────────────────────────────

/// Correct up to 16 byte errors in `block` in place.
fn correct_block(block: &mut [u8; BLOCK_LEN]) -> Result<(), ()> {
    let synd = syndromes(block);
    if synd.iter().all(|&s| s == 0) {
        return Ok(());
    }

    let err_loc = find_error_locator(&synd)?;
    let err_pos = find_errors(&err_loc)?;
    apply_forney(block, &synd, &err_loc, &err_pos);

    // A block with > 16 errors can converge on a bogus locator; re-check
    // the syndromes so garbage never reaches the framing layer.
    if syndromes(block).iter().all(|&s| s == 0) {
        Ok(())
    } else {
        Err(())
    }
}

/// `synd[i] = block(alpha^i)` for i in 0..32.
fn syndromes(block: &[u8; BLOCK_LEN]) -> [u8; PARITY_LEN] {
    let mut synd = [0u8; PARITY_LEN];
    for (i, s) in synd.iter_mut().enumerate() {
        *s = gf256::poly_eval(block, GF_EXP[i]);
    }
    synd
}

/// Berlekamp-Massey: derive the error locator polynomial from the
/// syndromes. Returns the locator most-significant coefficient first.
fn find_error_locator(synd: &[u8; PARITY_LEN]) -> Result<Vec<u8>, ()> {
    let mut err_loc = vec![1u8];
    let mut old_loc = vec![1u8];

    for i in 0..PARITY_LEN {
        let mut delta = synd[i];
        for j in 1..err_loc.len() {
            delta ^= gf256::mul(err_loc[err_loc.len() - 1 - j], synd[i - j]);
        }
        old_loc.push(0);

        if delta != 0 {
            if old_loc.len() > err_loc.len() {
                let new_loc = gf256::poly_scale(&old_loc, delta);
                old_loc = gf256::poly_scale(&err_loc, gf256::inv(delta));
                err_loc = new_loc;
            }
            err_loc = gf256::poly_add(&err_loc, &gf256::poly_scale(&old_loc, delta));
        }
    }

    while err_loc.len() > 1 && err_loc[0] == 0 {
        err_loc.remove(0);
    }
    let errs = err_loc.len() - 1;
    if errs * 2 > PARITY_LEN {
        return Err(());
    }
    Ok(err_loc)
}

/// Chien search: find the byte positions whose locations are roots of
/// the error locator. Fails when the root count disagrees with the
/// locator degree (detected miscorrection).
fn find_errors(err_loc: &[u8]) -> Result<Vec<usize>, ()> {
    let reversed: Vec<u8> = err_loc.iter().rev().copied().collect();
    let mut positions = Vec::new();
    for i in 0..BLOCK_LEN {
        if gf256::poly_eval(&reversed, GF_EXP[i]) == 0 {
            positions.push(BLOCK_LEN - 1 - i);
        }
    }
    if positions.len() != err_loc.len() - 1 {
        return Err(());
    }
    Ok(positions)
}

/// Forney's algorithm: compute the error magnitude at each position and
/// XOR it into the block.
fn apply_forney(block: &mut [u8; BLOCK_LEN], synd: &[u8; PARITY_LEN], err_loc: &[u8], err_pos: &[usize]) {
    // Error evaluator: omega(x) = synd(x) * lambda(x) mod x^32.
    let synd_poly: Vec<u8> = synd.iter().rev().copied().collect();
    let product = gf256::poly_mul(&synd_poly, err_loc);
    let omega = &product[product.len() - PARITY_LEN..];

    // Formal derivative of the locator: odd-degree terms survive.
    let l = err_loc.len();
    let mut deriv = vec![0u8; l - 1];
    for j in (1..l).step_by(2) {
        deriv[l - 1 - j] = err_loc[l - 1 - j];
    }

    for &pos in err_pos {
        // Byte at index `pos` is the coefficient of x^(254-pos), so the
        // location is X = alpha^(254-pos) and its inverse alpha^(pos+1).
        let x = GF_EXP[254 - pos];
        let x_inv = GF_EXP[(pos + 1) % 255];
        let y = gf256::poly_eval(omega, x_inv);
        let z = gf256::poly_eval(&deriv, x_inv);
        if z == 0 {
            // Degenerate locator; leave the byte alone, the post-check
            // in correct_block rejects the block.
            continue;
        }
        block[pos] ^= gf256::div(gf256::mul(x, y), z);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 13) as u8).collect()
    }

    #[test]
    fn encode_is_systematic() {
        let data = sample_data(100);
        let encoded = encode(&data);
        assert_eq!(encoded.len(), BLOCK_LEN);
        assert_eq!(&encoded[..100], &data[..]);
        assert!(encoded[100..DATA_LEN].iter().all(|&b| b == 0));
    }

    #[test]
    fn clean_roundtrip_single_block() {
        let data = sample_data(DATA_LEN);
        let encoded = encode(&data);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded[..DATA_LEN], &data[..]);
    }

    #[test]
    fn clean_roundtrip_multi_block() {
        let data = sample_data(DATA_LEN * 3 + 17);
        let encoded = encode(&data);
        assert_eq!(encoded.len(), BLOCK_LEN * 4);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded[..data.len()], &data[..]);
    }

    #[test]
    fn corrects_single_error() {
        let data = sample_data(DATA_LEN);
        let mut encoded = encode(&data);
        encoded[42] ^= 0x5A;
        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded[..DATA_LEN], &data[..]);
    }

    #[test]
    fn corrects_error_in_parity() {
        let data = sample_data(DATA_LEN);
        let mut encoded = encode(&data);
        encoded[240] ^= 0xFF;
        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded[..DATA_LEN], &data[..]);
    }

    #[test]
    fn corrects_sixteen_errors() {
        let data = sample_data(DATA_LEN);
        let mut encoded = encode(&data);
        for i in 0..16 {
            encoded[i * 13] ^= (i + 1) as u8;
        }
        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded[..DATA_LEN], &data[..]);
    }

    #[test]
    fn rejects_seventeen_errors() {
        let data = sample_data(DATA_LEN);
        let mut encoded = encode(&data);
        for i in 0..17 {
            encoded[i * 11] ^= 0xA5;
        }
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn corrects_errors_in_every_block() {
        let data = sample_data(DATA_LEN * 2);
        let mut encoded = encode(&data);
        encoded[10] ^= 0x11;
        encoded[BLOCK_LEN + 200] ^= 0x22;
        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded[..data.len()], &data[..]);
    }

    #[test]
    fn rejects_partial_block() {
        assert!(decode(&[0u8; 100]).is_err());
        assert!(decode(&[]).is_err());
    }
}
