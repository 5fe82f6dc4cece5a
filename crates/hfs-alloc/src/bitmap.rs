//! Bit operations on the allocation bitmap.
//!
//! The allocation file stores one bit per allocation block, most
//! significant bit first: block `n` is bit `7 - n % 8` of byte `n / 8`. A
//! set bit means the block is in use.

/// Mask selecting the bit of `idx` within its byte.
#[inline]
#[must_use]
pub fn bit_mask(idx: usize) -> u8 {
    0x80 >> (idx % 8)
}

/// True if bit `idx` is set. Bits past the slice read as set.
#[must_use]
pub fn bit_is_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .is_none_or(|byte| byte & bit_mask(idx) != 0)
}

/// Set `count` bits starting at `start`.
pub fn set_bits(bitmap: &mut [u8], start: usize, count: usize) {
    for idx in start..start + count {
        if let Some(byte) = bitmap.get_mut(idx / 8) {
            *byte |= bit_mask(idx);
        }
    }
}

/// Clear `count` bits starting at `start`.
pub fn clear_bits(bitmap: &mut [u8], start: usize, count: usize) {
    for idx in start..start + count {
        if let Some(byte) = bitmap.get_mut(idx / 8) {
            *byte &= !bit_mask(idx);
        }
    }
}

/// Number of set bits in `[start, start + count)`.
#[must_use]
pub fn count_set(bitmap: &[u8], start: usize, count: usize) -> usize {
    let end = start + count;
    let mut idx = start;
    let mut set = 0;
    while idx < end {
        if idx % 8 == 0 && idx + 8 <= end {
            if let Some(byte) = bitmap.get(idx / 8) {
                set += byte.count_ones() as usize;
                idx += 8;
                continue;
            }
        }
        if bit_is_set(bitmap, idx) {
            set += 1;
        }
        idx += 1;
    }
    set
}

/// True if every bit in `[start, start + count)` equals `value`.
#[must_use]
pub fn all_bits(bitmap: &[u8], start: usize, count: usize, value: bool) -> bool {
    let set = count_set(bitmap, start, count);
    if value { set == count } else { set == 0 }
}

/// First run of clear bits in `[start, end)` at least `min` long, extended
/// up to `max`. Returns `(first_bit, len)`.
///
/// Plain linear scan over one slice; the allocator uses the same rules
/// across cached bitmap blocks.
#[must_use]
pub fn find_clear_run(
    bitmap: &[u8],
    start: usize,
    end: usize,
    min: usize,
    max: usize,
) -> Option<(usize, usize)> {
    let mut run_start = start;
    let mut run_len = 0;
    let mut idx = start;
    while idx < end {
        if idx % 8 == 0 && idx + 8 <= end && bitmap.get(idx / 8) == Some(&0xFF) {
            if run_len >= min && run_len > 0 {
                return Some((run_start, run_len));
            }
            run_len = 0;
            idx += 8;
            continue;
        }
        if bit_is_set(bitmap, idx) {
            if run_len >= min && run_len > 0 {
                return Some((run_start, run_len));
            }
            run_len = 0;
        } else {
            if run_len == 0 {
                run_start = idx;
            }
            run_len += 1;
            if run_len == max {
                return Some((run_start, run_len));
            }
        }
        idx += 1;
    }
    (run_len >= min && run_len > 0).then_some((run_start, run_len))
}
