//! Bit-level helpers over group bitmap blocks
//!
//! Bit `i` of a group bitmap describes block `group_first_block + i`.
//! Bits are little-endian within each byte. Out-of-range indices read as
//! clear and are ignored on write.

/// True if bit `idx` is set
pub fn test_bit(bitmap: &[u8], idx: u32) -> bool {
    let byte = (idx / 8) as usize;
    match bitmap.get(byte) {
        Some(b) => (b >> (idx % 8)) & 1 == 1,
        None => false,
    }
}

/// Set bit `idx`; returns the previous value
pub fn set_bit(bitmap: &mut [u8], idx: u32) -> bool {
    let byte = (idx / 8) as usize;
    match bitmap.get_mut(byte) {
        Some(b) => {
            let mask = 1u8 << (idx % 8);
            let was = *b & mask != 0;
            *b |= mask;
            was
        }
        None => false,
    }
}

/// Clear bit `idx`; returns the previous value
pub fn clear_bit(bitmap: &mut [u8], idx: u32) -> bool {
    let byte = (idx / 8) as usize;
    match bitmap.get_mut(byte) {
        Some(b) => {
            let mask = 1u8 << (idx % 8);
            let was = *b & mask != 0;
            *b &= !mask;
            was
        }
        None => false,
    }
}

/// Number of clear bits among the first `len` bits
pub fn count_free(bitmap: &[u8], len: u32) -> u32 {
    let full = (len / 8) as usize;
    let mut free: u32 = bitmap.iter().take(full).map(|b| b.count_zeros()).sum();
    for idx in (full as u32 * 8)..len {
        if !test_bit(bitmap, idx) {
            free += 1;
        }
    }
    free
}

/// First clear bit in `start..len`, wrapping around to `0..start`
pub fn find_free(bitmap: &[u8], len: u32, start: u32) -> Option<u32> {
    let start = if start >= len { 0 } else { start };
    (start..len)
        .chain(0..start)
        .find(|&idx| !test_bit(bitmap, idx))
}

/// Clear every bit of `bitmap` that is set in `exclude`
pub fn mask_excluded(bitmap: &mut [u8], exclude: &[u8]) {
    for (b, e) in bitmap.iter_mut().zip(exclude.iter()) {
        *b &= !*e;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_set_clear_report_previous() {
        let mut bm = vec![0u8; 2];
        assert!(!set_bit(&mut bm, 9));
        assert!(set_bit(&mut bm, 9));
        assert_eq!(bm[1], 0x02);
        assert!(clear_bit(&mut bm, 9));
        assert!(!clear_bit(&mut bm, 9));
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut bm = vec![0u8; 1];
        assert!(!set_bit(&mut bm, 100));
        assert!(!test_bit(&bm, 100));
        assert_eq!(bm, vec![0]);
    }

    #[test]
    fn test_count_free_partial_byte() {
        let mut bm = vec![0u8; 2];
        set_bit(&mut bm, 0);
        set_bit(&mut bm, 10);
        set_bit(&mut bm, 15);
        // only the first 12 bits count
        assert_eq!(count_free(&bm, 12), 10);
    }

    #[test]
    fn test_find_free_wraps() {
        let mut bm = vec![0xffu8; 2];
        clear_bit(&mut bm, 3);
        assert_eq!(find_free(&bm, 16, 5), Some(3));
        assert_eq!(find_free(&bm, 16, 40), Some(3));
        set_bit(&mut bm, 3);
        assert_eq!(find_free(&bm, 16, 0), None);
    }

    #[test]
    fn test_mask_excluded() {
        let mut bm = vec![0b1111_0000u8, 0xff];
        mask_excluded(&mut bm, &[0b0011_0000, 0x0f]);
        assert_eq!(bm, vec![0b1100_0000, 0xf0]);
    }

    proptest! {
        #[test]
        fn prop_masked_bits_are_subset(
            live in proptest::collection::vec(any::<u8>(), 16),
            exclude in proptest::collection::vec(any::<u8>(), 16),
        ) {
            let mut masked = live.clone();
            mask_excluded(&mut masked, &exclude);
            for idx in 0..128u32 {
                if test_bit(&masked, idx) {
                    prop_assert!(test_bit(&live, idx));
                    prop_assert!(!test_bit(&exclude, idx));
                }
            }
        }

        #[test]
        fn prop_find_free_returns_clear_bit(
            bm in proptest::collection::vec(any::<u8>(), 8),
            start in 0u32..64,
        ) {
            match find_free(&bm, 64, start) {
                Some(idx) => prop_assert!(!test_bit(&bm, idx)),
                None => prop_assert_eq!(count_free(&bm, 64), 0),
            }
        }
    }
}
