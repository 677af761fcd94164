//! Length helpers mirroring the parcel writer.
//!
//! Every packet computes its wire length with these functions in the same
//! order it writes its fields, so the computed length always equals the
//! number of bytes serialized.

/// Width of a `u32`/`i32` field.
pub const U32: usize = 4;

/// Width of a `u64`/`i64`/`f64` field.
pub const U64: usize = 8;

/// Rounds `len` up to the next multiple of eight.
#[inline]
pub const fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Length of a byte vector: `u32` count plus bytes, padded to eight.
#[inline]
pub const fn bytes(len: usize) -> usize {
    align8(U32 + len)
}

/// Length of a string field.
#[inline]
pub fn string(s: &str) -> usize {
    bytes(s.len())
}

/// Length of a `u64` vector: `u32` count plus elements, padded to eight.
#[inline]
pub const fn u64_vec(count: usize) -> usize {
    align8(U32 + U64 * count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align8_rounds_up() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(13), 16);
    }

    #[test]
    fn collection_lengths_include_prefix_and_padding() {
        assert_eq!(bytes(0), 8);
        assert_eq!(bytes(4), 8);
        assert_eq!(bytes(5), 16);
        assert_eq!(string("abc"), 8);
        assert_eq!(u64_vec(0), 8);
        assert_eq!(u64_vec(1), 16);
        assert_eq!(u64_vec(2), 24);
    }
}
