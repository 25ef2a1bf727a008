/// Round up `n` to the nearest multiple of `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * n.div_ceil(to)
}

/// Round `n` down to a multiple of `align`, which must be a power of two
pub fn align_down(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    n & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn round_up_computes_correctly() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_up(52, 8), 56);
    }

    #[test]
    pub fn align_down_computes_correctly() {
        assert_eq!(align_down(4095, 16), 4080);
        assert_eq!(align_down(4096, 4096), 4096);
        assert_eq!(align_down(7, 8), 0);
    }
}
