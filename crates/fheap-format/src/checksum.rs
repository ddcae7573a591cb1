//! Metadata checksums based on [Bob Jenkins' `lookup3.c`][0].
//!
//! Header and indirect-block images end in a 4-byte little-endian checksum
//! computed over everything before it; direct blocks carry the same field
//! near the front of the block when the heap enables per-block checksums.
//! Not intended for cryptographic purposes.
//!
//! [0]: https://www.burtleburtle.net/bob/c/lookup3.c

/// Size of the stored checksum field, in bytes.
pub const CHECKSUM_SIZE: usize = 4;

/// Mix 3 `u32` values reversibly.
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);

    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);

    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);

    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);

    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);

    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

/// Final mixing of 3 `u32` values.
fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));

    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));

    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));

    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));

    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));

    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));

    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

/// Little-endian `u32` at offset `i`.
fn word(k: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([k[i], k[i + 1], k[i + 2], k[i + 3]])
}

/// Hash a variable-length key into a `u32` (`hashlittle`).
pub fn lookup3(key: &[u8], initval: u32) -> u32 {
    let mut a = 0xdeadbeef_u32
        .wrapping_add((key.len() & (u32::MAX as usize)) as u32)
        .wrapping_add(initval);
    let mut b = a;
    let mut c = a;
    let mut k = key;

    if k.is_empty() {
        // Empty keys need no mixing
        return c;
    }

    // The original recast byte pointers as `uint32_t*` and dealt with
    // alignment; copying through `from_le_bytes` sidesteps that entirely.
    while k.len() > 12 {
        a = a.wrapping_add(word(k, 0));
        b = b.wrapping_add(word(k, 4));
        c = c.wrapping_add(word(k, 8));
        mix(&mut a, &mut b, &mut c);
        k = &k[12..];
    }

    // Last, possibly-short block. The C version falls through a switch with
    // short reads, treating missing high bytes as zero; zero-padding a local
    // buffer is equivalent.
    let mut tail = [0u8; 12];
    tail[..k.len()].copy_from_slice(k);

    a = a.wrapping_add(word(&tail, 0));
    if k.len() > 4 {
        b = b.wrapping_add(word(&tail, 4));
    }
    if k.len() > 8 {
        c = c.wrapping_add(word(&tail, 8));
    }

    final_mix(&mut a, &mut b, &mut c);

    c
}

/// Checksum over a block of metadata.
pub fn metadata_checksum(data: &[u8]) -> u32 {
    lookup3(data, 0)
}

/// Split an image into its body and its stored trailing checksum.
///
/// # Panics
/// Panics if `image` is shorter than the checksum field.
pub fn split_trailing(image: &[u8]) -> (&[u8], u32) {
    assert!(image.len() >= CHECKSUM_SIZE, "image shorter than its checksum");
    let (body, tail) = image.split_at(image.len() - CHECKSUM_SIZE);
    (body, word(tail, 0))
}

/// Verify the trailing checksum of a serialized image.
pub fn verify_trailing(image: &[u8]) -> bool {
    let (body, stored) = split_trailing(image);
    stored == metadata_checksum(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference values from lookup3.c's self-test, initval 0.
    #[test]
    fn matches_reference_vectors() {
        assert_eq!(lookup3(b"", 0), 0xdeadbeef);
        assert_eq!(lookup3(b"Four score and seven years ago", 0), 0x17770551);
    }

    #[test]
    fn initval_changes_hash() {
        assert_ne!(lookup3(b"abc", 0), lookup3(b"abc", 1));
    }

    #[test]
    fn trailing_checksum_round_trip() {
        let mut image = b"some serialized block body".to_vec();
        let sum = metadata_checksum(&image);
        image.extend_from_slice(&sum.to_le_bytes());
        assert!(verify_trailing(&image));
    }

    #[test]
    fn any_single_byte_flip_is_detected() {
        let mut image = (0u8..200).collect::<Vec<u8>>();
        let sum = metadata_checksum(&image);
        image.extend_from_slice(&sum.to_le_bytes());

        for pos in 0..image.len() - CHECKSUM_SIZE {
            let mut corrupted = image.clone();
            corrupted[pos] ^= 0x01;
            assert!(!verify_trailing(&corrupted), "flip at {pos} went unnoticed");
        }
    }
}
