//! Rolling 32-bit checksum over the journal block stream.

use once_cell::sync::Lazy;

/// Checksum of the empty byte string; the header block of every log file
/// starts from this value.
pub const NULL_CHECKSUM: u32 = 0;

static LINE_FEED_CHECKSUM: Lazy<u32> = Lazy::new(|| update(NULL_CHECKSUM, b"\n"));

/// Seed of every block after the header: the checksum of the single `\n`
/// that terminated the previous block's trailer line.
pub fn line_feed_checksum() -> u32 {
    *LINE_FEED_CHECKSUM
}

/// Extends `checksum` with `bytes`.
pub fn update(checksum: u32, bytes: &[u8]) -> u32 {
    crc32c::crc32c_append(checksum, bytes)
}

/// Checksum of a concatenation, given the checksum of the prefix, the
/// checksum of the suffix, and the suffix length. Lets the writer splice in
/// an externally checksummed block payload without rescanning its bytes.
pub fn combine(prefix: u32, suffix: u32, suffix_len: usize) -> u32 {
    crc32c::crc32c_combine(prefix, suffix, suffix_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_is_incremental() {
        let whole = update(NULL_CHECKSUM, b"commit marker line");
        let split = update(update(NULL_CHECKSUM, b"commit "), b"marker line");
        assert_eq!(whole, split);
    }

    #[test]
    fn update_with_empty_slice_is_identity() {
        let checksum = update(NULL_CHECKSUM, b"abc");
        assert_eq!(update(checksum, b""), checksum);
    }

    #[test]
    fn combine_matches_direct_update() {
        let prefix = b"mkdir/p/2f746d70\n".as_slice();
        let suffix = b"create/p/2f746d702f61\n".as_slice();
        let combined = combine(
            update(NULL_CHECKSUM, prefix),
            update(NULL_CHECKSUM, suffix),
            suffix.len(),
        );
        let direct = update(update(NULL_CHECKSUM, prefix), suffix);
        assert_eq!(combined, direct);
    }

    #[test]
    fn line_feed_seed_matches_update() {
        assert_eq!(line_feed_checksum(), update(NULL_CHECKSUM, b"\n"));
    }
}
