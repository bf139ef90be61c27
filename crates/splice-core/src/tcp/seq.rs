//! Sequence number arithmetic modulo 2^32

/// `a` precedes `b`
#[inline]
pub fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` follows `b`
#[inline]
pub fn after(a: u32, b: u32) -> bool {
    before(b, a)
}

/// `lo <= x < hi` in sequence space
#[inline]
pub fn in_window(x: u32, lo: u32, hi: u32) -> bool {
    x.wrapping_sub(lo) < hi.wrapping_sub(lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraparound() {
        assert!(before(0xFFFF_FFF0, 0x10));
        assert!(after(0x10, 0xFFFF_FFF0));
        assert!(!before(5, 5));
        assert!(in_window(2, 0xFFFF_FFFE, 10));
        assert!(!in_window(10, 0xFFFF_FFFE, 10));
    }
}
