/// Static cast the given 64-bit unsigned integer to a 64-bit signed integer.
/// This is probably only useful when some other code provides you a u64
///  that is meant to be an i64 (aka. uncommon).
///
/// In C: `*(int64_t *)&i`
pub fn u64_i64(i: u64) -> i64 {
    // Rust guarantees this cast to work
    // (the signed number representation is 2s complement).
    i as i64
}

/// Static cast the given 64-bit signed integer to a 64-bit unsigned integer.
///
/// In C: `*(uint64_t *)&i`
pub fn i64_u64(i: i64) -> u64 {
    i as u64
}

/// Add a signed displacement to an unsigned address,
/// returning None on over/underflow.
pub fn va_add_signed(va: u64, rva: i64) -> Option<u64> {
    if rva >= 0 {
        va.checked_add(rva as u64)
    } else if i64::abs(rva) as u64 > va {
        None
    } else {
        Some(va - i64::abs(rva) as u64)
    }
}
