//! Stateless byte-level mutation operators and the havoc stack.
//!
//! Every operator takes the input by reference and a caller-supplied RNG, so
//! the engine owns all randomness and tests can run seeded. None of them
//! panics on empty input; they hand the buffer back unchanged instead.

use rand::Rng;

/// Inputs never grow past this inside a single operator. The scheduler
/// enforces the configured seed-size bound at ingestion; this only stops
/// gross runaway within a havoc stack.
const MAX_GROWTH: usize = 100 * 1024;

/// Boundary values that keep showing up in integer comparisons and length
/// fields, after AFL++'s interesting-value tables.
const INTERESTING_8: &[i32] = &[-128, -1, 0, 1, 16, 32, 64, 100, 127];
const INTERESTING_16: &[i32] = &[
    -32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767,
];
const INTERESTING_32: &[i32] = &[
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];

pub struct Mutator;

impl Mutator {
    /// Flips `flips` random bits.
    pub fn bit_flip<R: Rng>(data: &[u8], flips: usize, rng: &mut R) -> Vec<u8> {
        let mut out = data.to_vec();
        if out.is_empty() {
            return out;
        }
        for _ in 0..flips {
            let bit = rng.gen_range(0..out.len() * 8);
            out[bit / 8] ^= 1 << (bit % 8);
        }
        out
    }

    /// XORs `flips` random bytes with 0xFF.
    pub fn byte_flip<R: Rng>(data: &[u8], flips: usize, rng: &mut R) -> Vec<u8> {
        let mut out = data.to_vec();
        if out.is_empty() {
            return out;
        }
        for _ in 0..flips {
            let idx = rng.gen_range(0..out.len());
            out[idx] ^= 0xFF;
        }
        out
    }

    /// Adds or subtracts a value in [1, 35] to one random byte, mod 256.
    pub fn arithmetic<R: Rng>(data: &[u8], rng: &mut R) -> Vec<u8> {
        let mut out = data.to_vec();
        if out.is_empty() {
            return out;
        }
        let idx = rng.gen_range(0..out.len());
        let val = rng.gen_range(1..=35u8);
        out[idx] = if rng.gen() {
            out[idx].wrapping_add(val)
        } else {
            out[idx].wrapping_sub(val)
        };
        out
    }

    /// Overwrites a random 1/2/4-byte window with a boundary value,
    /// little-endian. Falls through to narrower widths when the input is too
    /// short for the chosen one.
    pub fn interesting_values<R: Rng>(data: &[u8], rng: &mut R) -> Vec<u8> {
        let mut out = data.to_vec();
        if out.is_empty() {
            return out;
        }

        let choice = rng.gen_range(0..3);
        if choice == 0 {
            let idx = rng.gen_range(0..out.len());
            let val = INTERESTING_8[rng.gen_range(0..INTERESTING_8.len())];
            out[idx] = val as u8;
        } else if choice == 1 && out.len() >= 2 {
            let idx = rng.gen_range(0..=out.len() - 2);
            let pool = rng.gen_range(0..INTERESTING_8.len() + INTERESTING_16.len());
            let val = if pool < INTERESTING_8.len() {
                INTERESTING_8[pool]
            } else {
                INTERESTING_16[pool - INTERESTING_8.len()]
            };
            out[idx..idx + 2].copy_from_slice(&(val as i16 as u16).to_le_bytes());
        } else if out.len() >= 4 {
            let idx = rng.gen_range(0..=out.len() - 4);
            let pool = rng
                .gen_range(0..INTERESTING_8.len() + INTERESTING_16.len() + INTERESTING_32.len());
            let val = if pool < INTERESTING_8.len() {
                INTERESTING_8[pool]
            } else if pool < INTERESTING_8.len() + INTERESTING_16.len() {
                INTERESTING_16[pool - INTERESTING_8.len()]
            } else {
                INTERESTING_32[pool - INTERESTING_8.len() - INTERESTING_16.len()]
            };
            out[idx..idx + 4].copy_from_slice(&(val as u32).to_le_bytes());
        }
        out
    }

    /// Inserts one random byte at a random position.
    pub fn insert<R: Rng>(data: &[u8], rng: &mut R) -> Vec<u8> {
        if data.len() >= MAX_GROWTH {
            return data.to_vec();
        }
        let mut out = data.to_vec();
        let pos = rng.gen_range(0..=out.len());
        out.insert(pos, rng.gen());
        out
    }

    /// Removes one random byte.
    pub fn delete<R: Rng>(data: &[u8], rng: &mut R) -> Vec<u8> {
        let mut out = data.to_vec();
        if out.is_empty() {
            return out;
        }
        let pos = rng.gen_range(0..out.len());
        out.remove(pos);
        out
    }

    /// Concatenates a random prefix of `a` with a random suffix of `b`.
    /// With one side empty, the other is returned whole.
    pub fn splice<R: Rng>(a: &[u8], b: &[u8], rng: &mut R) -> Vec<u8> {
        if a.is_empty() {
            return b.to_vec();
        }
        if b.is_empty() {
            return a.to_vec();
        }
        let cut_a = rng.gen_range(0..=a.len());
        let cut_b = rng.gen_range(0..=b.len());
        let mut out = Vec::with_capacity(cut_a + b.len() - cut_b);
        out.extend_from_slice(&a[..cut_a]);
        out.extend_from_slice(&b[cut_b..]);
        out
    }

    /// Stacks `iterations` randomly chosen operators on top of each other.
    pub fn havoc<R: Rng>(data: &[u8], iterations: usize, rng: &mut R) -> Vec<u8> {
        let mut out = data.to_vec();
        for _ in 0..iterations {
            out = match rng.gen_range(0..6) {
                0 => Self::bit_flip(&out, 1, rng),
                1 => Self::byte_flip(&out, 1, rng),
                2 => Self::arithmetic(&out, rng),
                3 => Self::interesting_values(&out, rng),
                4 => Self::insert(&out, rng),
                _ => Self::delete(&out, rng),
            };
        }
        out
    }
}
