//! Deterministic per-molecule draw derived from the UMI in a read name
//!
//! The draw ties every mutation decision to the originating molecule rather
//! than to the individual read: two reads whose UMI suffix is byte-identical
//! (for example mate 1 and mate 2 of one template) always get the same draw.
//!
//! The hash is the khash X31 string hash followed by Thomas Wang's 32-bit
//! integer mix; the low 24 bits are scaled into `[0, 1)`.

/// Separator between the read-name prefix and the embedded UMI.
pub const DEFAULT_UMI_SEPARATOR: u8 = b'#';

const DRAW_BITS_MASK: u32 = 0x00ff_ffff;
const DRAW_SCALE: f64 = 16_777_216.0; // 2^24

/// Return the bytes of `name` that carry the UMI: everything after the last
/// `separator`, or the whole name if the separator is absent.
pub fn umi_suffix(name: &[u8], separator: u8) -> &[u8] {
    match name.iter().rposition(|&b| b == separator) {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

/// X31 string hash (`h = h * 31 + c`), as used by khash for C strings.
pub fn x31_hash(bytes: &[u8]) -> u32 {
    let mut iter = bytes.iter();
    let mut h = match iter.next() {
        Some(&first) => u32::from(first),
        None => return 0,
    };
    for &b in iter {
        h = (h << 5).wrapping_sub(h).wrapping_add(u32::from(b));
    }
    h
}

/// Thomas Wang's 32-bit avalanche mix.
pub fn wang_hash(mut key: u32) -> u32 {
    key = key.wrapping_add(!(key << 15));
    key ^= key >> 10;
    key = key.wrapping_add(key << 3);
    key ^= key >> 6;
    key = key.wrapping_add(!(key << 11));
    key ^= key >> 16;
    key
}

/// Full 32-bit UMI hash of a read name.
pub fn umi_hash(name: &[u8], separator: u8) -> u32 {
    wang_hash(x31_hash(umi_suffix(name, separator)))
}

/// Draw in `[0, 1)` for a read name.
pub fn umi_draw(name: &[u8], separator: u8) -> f64 {
    f64::from(umi_hash(name, separator) & DRAW_BITS_MASK) / DRAW_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_umi_suffix_uses_last_separator() {
        assert_eq!(umi_suffix(b"run1#lane2#ACGTACGT", b'#'), b"ACGTACGT");
        assert_eq!(umi_suffix(b"read:ACGT", b':'), b"ACGT");
    }

    #[test]
    fn test_umi_suffix_without_separator_is_whole_name() {
        assert_eq!(umi_suffix(b"SRR123.45", b'#'), b"SRR123.45");
    }

    #[test]
    fn test_umi_suffix_trailing_separator_is_empty() {
        assert_eq!(umi_suffix(b"read#", b'#'), b"");
    }

    #[test]
    fn test_x31_hash_known_values() {
        assert_eq!(x31_hash(b""), 0);
        assert_eq!(x31_hash(b"A"), 65);
        // 'A' * 31 + 'C'
        assert_eq!(x31_hash(b"AC"), 65 * 31 + 67);
        assert_eq!(x31_hash(b"ACG"), (65 * 31 + 67) * 31 + 71);
    }

    #[test]
    fn test_x31_hash_wraps() {
        let long = vec![b'T'; 64];
        // Must not panic on overflow in debug builds
        let _ = x31_hash(&long);
    }

    #[test]
    fn test_wang_hash_known_values() {
        assert_eq!(wang_hash(0), 0x4636_b9c9);
        assert_eq!(wang_hash(65), 0xfffc_eb8d);
    }

    #[test]
    fn test_draw_known_values() {
        assert_eq!(umi_draw(b"frag#AAAA", b'#'), 0.10158228874206543);
        assert_eq!(umi_draw(b"frag#CCCC", b'#'), 0.5624170303344727);
        assert_eq!(umi_draw(b"frag#TTTT", b'#'), 0.8489980697631836);
    }

    #[test]
    fn test_draw_is_deterministic() {
        let a = umi_draw(b"read_1#ACGTTGCA", DEFAULT_UMI_SEPARATOR);
        let b = umi_draw(b"read_1#ACGTTGCA", DEFAULT_UMI_SEPARATOR);
        assert_eq!(a, b);
    }

    #[test]
    fn test_draw_depends_only_on_umi_suffix() {
        let r1 = umi_draw(b"frag7:r1#GATTACA", DEFAULT_UMI_SEPARATOR);
        let r2 = umi_draw(b"frag9:r2#GATTACA", DEFAULT_UMI_SEPARATOR);
        assert_eq!(r1, r2);
    }

    #[test]
    fn test_draw_in_unit_interval() {
        for i in 0..1000 {
            let name = format!("read{}#UMI{}", i, i * 7919);
            let p = umi_draw(name.as_bytes(), DEFAULT_UMI_SEPARATOR);
            assert!((0.0..1.0).contains(&p), "draw {} out of range", p);
        }
    }

    #[test]
    fn test_draw_matches_low_24_bits() {
        let name = b"q#TTAGGC";
        let h = umi_hash(name, b'#');
        let p = umi_draw(name, b'#');
        assert_eq!(p, f64::from(h & 0xffffff) / 16_777_216.0);
    }

    #[test]
    fn test_draw_roughly_uniform() {
        let n = 20_000;
        let below_half = (0..n)
            .filter(|i| umi_draw(format!("r#{:08}", i).as_bytes(), b'#') < 0.5)
            .count();
        let frac = below_half as f64 / n as f64;
        assert!((0.4..0.6).contains(&frac), "fraction below 0.5 was {}", frac);
    }
}
