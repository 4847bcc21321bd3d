//! Fletcher-4 checksum as used by the entry format.
//!
//! The input is consumed as a stream of little-endian 32 bit words feeding
//! four 64 bit accumulator lanes. Inputs whose length is not a multiple of
//! four are padded with a zero-extended final word, so the aligned and the
//! variable-size paths agree on padded data.

/// The four accumulator lanes, in feed order.
pub type Fletcher4 = [u64; 4];

pub fn fletcher4(data: &[u8]) -> Fletcher4 {
    let mut a = 0u64;
    let mut b = 0u64;
    let mut c = 0u64;
    let mut d = 0u64;

    let mut words = data.chunks_exact(4);
    for word in words.by_ref() {
        let word = u32::from_le_bytes(word.try_into().unwrap()) as u64;
        a = a.wrapping_add(word);
        b = b.wrapping_add(a);
        c = c.wrapping_add(b);
        d = d.wrapping_add(c);
    }

    let tail = words.remainder();
    if !tail.is_empty() {
        let mut last = [0u8; 4];
        last[..tail.len()].copy_from_slice(tail);
        let word = u32::from_le_bytes(last) as u64;
        a = a.wrapping_add(word);
        b = b.wrapping_add(a);
        c = c.wrapping_add(b);
        d = d.wrapping_add(c);
    }

    [a, b, c, d]
}
