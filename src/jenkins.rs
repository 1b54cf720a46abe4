//! Bob Jenkins' lookup3 `hashlittle2`.
//!
//! Used twice: as the rolling checksum of local `.idx` files and as the
//! 64-bit path name hash of the root table. Words are read little-endian;
//! the tail is zero-padded to a whole 12-byte block, which is equivalent to
//! the masked tail reads of the reference implementation.

#[inline]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c); *a ^= c.rotate_left(4);  *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a); *b ^= a.rotate_left(6);  *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b); *c ^= b.rotate_left(8);  *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c); *a ^= c.rotate_left(16); *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a); *b ^= a.rotate_left(19); *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b); *c ^= b.rotate_left(4);  *b = b.wrapping_add(*a);
}

#[inline]
fn finalize(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b; *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c; *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a; *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b; *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c; *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a; *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b; *c = c.wrapping_sub(b.rotate_left(24));
}

#[inline]
fn word(block: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([block[i], block[i + 1], block[i + 2], block[i + 3]])
}

/// `hashlittle2`: `pc` and `pb` are both seeds and outputs, so a sequence
/// of calls over consecutive records chains the state.
pub fn hashlittle2(data: &[u8], pc: &mut u32, pb: &mut u32) {
    let len = data.len();
    let init = 0xdead_beef_u32
        .wrapping_add(len as u32)
        .wrapping_add(*pc);
    let (mut a, mut b, mut c) = (init, init, init.wrapping_add(*pb));

    if len == 0 {
        *pc = c;
        *pb = b;
        return;
    }

    let mut chunks = data.chunks(12).peekable();
    while let Some(chunk) = chunks.next() {
        let mut block = [0u8; 12];
        block[..chunk.len()].copy_from_slice(chunk);
        a = a.wrapping_add(word(&block, 0));
        b = b.wrapping_add(word(&block, 4));
        c = c.wrapping_add(word(&block, 8));
        if chunks.peek().is_some() {
            mix(&mut a, &mut b, &mut c);
        } else {
            finalize(&mut a, &mut b, &mut c);
        }
    }

    *pc = c;
    *pb = b;
}

/// Single-shot 64-bit form: `(pc << 32) | pb` with zero seeds.
pub fn hash64(data: &[u8]) -> u64 {
    let (mut pc, mut pb) = (0u32, 0u32);
    hashlittle2(data, &mut pc, &mut pb);
    ((pc as u64) << 32) | pb as u64
}

/// Root-table name hash of a virtual path. `/` and `\` are treated alike
/// and case is ignored, so `World/Maps/a.wdt` and `WORLD\MAPS\A.WDT`
/// collide on purpose. The path is hashed as ASCII: every character
/// outside it counts as `?`.
pub fn path_hash(path: &str) -> u64 {
    let normalized: Vec<u8> = path.chars()
        .map(|c| match c {
            '/' => b'\\',
            c if c.is_ascii() => c.to_ascii_uppercase() as u8,
            _ => b'?',
        })
        .collect();
    hash64(&normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_returns_seed() {
        let (mut pc, mut pb) = (0, 0);
        hashlittle2(b"", &mut pc, &mut pb);
        assert_eq!((pc, pb), (0xdeadbeef, 0xdeadbeef));
    }

    #[test]
    fn reference_vector() {
        let (mut pc, mut pb) = (0, 0);
        hashlittle2(b"Four score and seven years ago", &mut pc, &mut pb);
        assert_eq!(pc, 0x17770551);
        assert_eq!(pb, 0xce7226e6);
    }

    #[test]
    fn path_hash_normalizes() {
        assert_eq!(
            path_hash("interface/icons/foo.blp"),
            path_hash("INTERFACE\\ICONS\\FOO.BLP"),
        );
        assert_ne!(path_hash("a/b"), path_hash("a/c"));
    }

    #[test]
    fn path_hash_treats_non_ascii_as_question_mark() {
        assert_eq!(path_hash("sound/caf\u{e9}.ogg"), hash64(b"SOUND\\CAF?.OGG"));
        assert_eq!(path_hash("\u{1f600}"), path_hash("?"));
        assert_ne!(path_hash("caf\u{e9}"), hash64("CAF\u{c9}".as_bytes()));
    }

    #[test]
    fn chaining_differs_from_single_shot() {
        let (mut pc, mut pb) = (0, 0);
        hashlittle2(b"first record", &mut pc, &mut pb);
        let first = pc;
        hashlittle2(b"second record", &mut pc, &mut pb);
        let (mut fresh_c, mut fresh_b) = (0, 0);
        hashlittle2(b"second record", &mut fresh_c, &mut fresh_b);
        assert_ne!(first, pc);
        assert_ne!(pc, fresh_c);
    }
}
