//! Sequence-space comparisons modulo 2^32 (RFC 1982 serial arithmetic).

/// `a` is strictly before `b`.
#[inline]
pub fn lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` is before or equal to `b`.
#[inline]
pub fn le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a` is strictly after `b`.
#[inline]
pub fn gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// `a` is after or equal to `b`.
#[inline]
pub fn ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// The later of two sequence numbers.
#[inline]
pub fn max(a: u32, b: u32) -> u32 {
    if gt(a, b) {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparisons_wrap_around() {
        assert!(lt(0xFFFF_FFF0, 0x10));
        assert!(gt(0x10, 0xFFFF_FFF0));
        assert!(le(5, 5));
        assert!(ge(5, 5));
        assert!(!lt(5, 5));
        assert_eq!(max(0xFFFF_FFFF, 2), 2);
    }
}
