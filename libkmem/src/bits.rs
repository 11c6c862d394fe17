//! Bit-scan primitives used to turn sizes into power-of-two orders.

/// Index of the lowest set bit of `x`, or `None` if `x` is zero.
#[inline]
pub const fn bit_scan_forward(x: usize) -> Option<u32> {
    if x == 0 {
        None
    } else {
        Some(x.trailing_zeros())
    }
}

/// Index of the highest set bit of `x`, or `None` if `x` is zero.
#[inline]
pub const fn bit_scan_reverse(x: usize) -> Option<u32> {
    if x == 0 {
        None
    } else {
        Some(usize::BITS - 1 - x.leading_zeros())
    }
}

/// `log2(x)` rounded up. Both `0` and `1` map to `0`.
#[inline]
pub const fn ceil_log2(x: usize) -> u32 {
    match (bit_scan_reverse(x), bit_scan_forward(x)) {
        (Some(hi), Some(lo)) if hi != lo => hi + 1,
        (Some(hi), _) => hi,
        (None, _) => 0,
    }
}

/// Index of the lowest clear bit of `word`, or `None` if every bit is set.
#[inline]
pub const fn first_clear_bit(word: u64) -> Option<u32> {
    let inv = !word;
    if inv == 0 {
        None
    } else {
        Some(inv.trailing_zeros())
    }
}
