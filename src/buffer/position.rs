//! Position arithmetic for term-structured streams
//!
//! A position is a monotonic 64-bit byte offset since the stream began. It
//! decomposes deterministically into a term count (how many terms have been
//! filled) and an offset within the active term, because term lengths are
//! powers of two.

/// Number of term partitions recycled round-robin in a log buffer
pub const PARTITION_COUNT: usize = 3;

/// log2 of the term length; the shift that splits a position into
/// (term count, term offset)
#[inline]
pub fn position_bits_to_shift(term_length: usize) -> u32 {
    debug_assert!(term_length.is_power_of_two());
    term_length.trailing_zeros()
}

/// Compose a stream position from a term id and an offset within that term
#[inline]
pub fn compute_position(term_id: i32, term_offset: i32, bits: u32, initial_term_id: i32) -> i64 {
    let term_count = i64::from(term_id.wrapping_sub(initial_term_id));
    (term_count << bits) + i64::from(term_offset)
}

/// Term id that a position falls into
#[inline]
pub fn term_id_from_position(position: i64, bits: u32, initial_term_id: i32) -> i32 {
    (position >> bits) as i32 + initial_term_id
}

/// Offset within the term that a position falls at
#[inline]
pub fn term_offset_from_position(position: i64, bits: u32) -> i32 {
    (position & ((1i64 << bits) - 1)) as i32
}

/// Partition index used by a given term count
#[inline]
pub fn index_by_term_count(term_count: i64) -> usize {
    (term_count % PARTITION_COUNT as i64) as usize
}

/// Pack a term id and a tail offset into one 64-bit tail counter
#[inline]
pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    (i64::from(term_id) << 32) | (i64::from(term_offset) & 0xFFFF_FFFF)
}

/// Term id half of a packed tail counter
#[inline]
pub fn tail_term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Offset half of a packed tail counter, clamped to the term length.
/// Competing claims can push the raw value past the end of the term.
#[inline]
pub fn tail_term_offset(raw_tail: i64, term_length: usize) -> i32 {
    let offset = raw_tail & 0xFFFF_FFFF;
    offset.min(term_length as i64) as i32
}

/// Highest position a stream with this term length can ever reach
#[inline]
pub fn max_position(term_length: usize) -> i64 {
    (term_length as i64) << 31
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_round_trip() {
        let term_length = 64 * 1024;
        let bits = position_bits_to_shift(term_length);
        assert_eq!(bits, 16);

        let initial_term_id = 17;
        for (term_id, offset) in [(17, 0), (18, 96), (20, 4096)] {
            let position = compute_position(term_id, offset, bits, initial_term_id);
            assert_eq!(term_id_from_position(position, bits, initial_term_id), term_id);
            assert_eq!(term_offset_from_position(position, bits), offset);
        }
    }

    #[test]
    fn test_tail_packing() {
        let raw = pack_tail(42, 1024);
        assert_eq!(tail_term_id(raw), 42);
        assert_eq!(tail_term_offset(raw, 64 * 1024), 1024);

        // competing claims can overrun the term; the offset clamps
        let raw = pack_tail(42, (64 * 1024) + 512);
        assert_eq!(tail_term_offset(raw, 64 * 1024), 64 * 1024);
    }

    #[test]
    fn test_partition_rotation() {
        assert_eq!(index_by_term_count(0), 0);
        assert_eq!(index_by_term_count(1), 1);
        assert_eq!(index_by_term_count(2), 2);
        assert_eq!(index_by_term_count(3), 0);
    }

    #[test]
    fn test_max_position() {
        assert_eq!(max_position(64 * 1024), (64 * 1024) << 31);
    }
}
