//! Client-to-server payload masking (RFC 6455 §5.3).
//!
//! # How masking works
//!
//! Every byte of a masked payload is XORed with one byte of a 4-byte key,
//! cycling through the key: byte `i` uses `key[i % 4]`.  XOR is its own
//! inverse, so the same function masks and unmasks.
//!
//! Payloads are often processed in pieces (a frame arriving over several
//! reads, or a large frame encoded in slices).  [`apply_masking_key`] therefore
//! takes the key index the piece starts at and returns the index the next
//! piece must start at.

/// XORs `data` in place with `key`, starting at key position `index`.
///
/// Returns the key position for the byte following `data`, so consecutive
/// calls over adjacent slices produce the same result as one call over the
/// concatenation.
///
/// # Examples
///
/// ```rust
/// use tether_core::apply_masking_key;
///
/// let key = [0x37, 0xFA, 0x21, 0x3D];
/// let mut whole = b"Hello".to_vec();
/// apply_masking_key(&mut whole, key, 0);
///
/// let mut split = b"Hello".to_vec();
/// let next = apply_masking_key(&mut split[..3], key, 0);
/// apply_masking_key(&mut split[3..], key, next);
///
/// assert_eq!(whole, split);
/// assert_eq!(whole, vec![0x7f, 0x9f, 0x4d, 0x51, 0x58]);
/// ```
pub fn apply_masking_key(data: &mut [u8], key: [u8; 4], index: usize) -> usize {
    let start = index % 4;
    for (offset, byte) in data.iter_mut().enumerate() {
        *byte ^= key[(start + offset) % 4];
    }
    (start + data.len()) % 4
}

/// Returns a fresh random masking key.
///
/// Clients must pick a new key for every frame they send.
pub fn generate_masking_key() -> [u8; 4] {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masking_twice_restores_original() {
        let key = [1, 2, 3, 4];
        let original = b"round and round".to_vec();
        let mut data = original.clone();

        apply_masking_key(&mut data, key, 0);
        assert_ne!(data, original);
        apply_masking_key(&mut data, key, 0);

        assert_eq!(data, original);
    }

    #[test]
    fn test_masking_resumes_at_returned_index() {
        let key = [0xAA, 0xBB, 0xCC, 0xDD];
        let mut whole = (0u8..50).collect::<Vec<_>>();
        let mut pieces = whole.clone();
        apply_masking_key(&mut whole, key, 0);

        let mut index = 0;
        for chunk in pieces.chunks_mut(7) {
            index = apply_masking_key(chunk, key, index);
        }

        assert_eq!(whole, pieces);
        assert_eq!(index, 50 % 4);
    }

    #[test]
    fn test_masking_empty_slice_keeps_index() {
        let mut empty: [u8; 0] = [];
        assert_eq!(apply_masking_key(&mut empty, [9, 9, 9, 9], 3), 3);
    }

    #[test]
    fn test_generated_keys_differ() {
        // Four random bytes colliding ten times in a row is not a realistic outcome.
        let first = generate_masking_key();
        let all_same = (0..10).all(|_| generate_masking_key() == first);
        assert!(!all_same);
    }
}
