/// Seed of the rolling hash.
const HASH_SEED: i32 = 5381;

/// Keys shorter than this are repeated until they reach the length.
const MIN_KEY_LENGTH: usize = 8;

/// Computes the rolling hash of a correlation key.
///
/// The hash runs over the UTF-16 code units of the key with `hash * 33 + unit` in 32 bit
/// wrapping arithmetic. Keys shorter than eight units are concatenated with themselves first.
/// The empty key hashes to `0`.
pub fn hash_code(key: &str) -> i32 {
    let mut units: Vec<u16> = key.encode_utf16().collect();
    if units.is_empty() {
        return 0;
    }

    while units.len() < MIN_KEY_LENGTH {
        units.extend_from_within(..);
    }

    units.iter().fold(HASH_SEED, |hash, &unit| {
        hash.wrapping_mul(33).wrapping_add(i32::from(unit))
    })
}

/// Returns the sampling score of a correlation key in `[0, 100)`.
///
/// The score is the absolute hash normalized by the maximum positive 32 bit value.
pub fn score(key: &str) -> f64 {
    normalize(hash_code(key))
}

fn normalize(hash: i32) -> f64 {
    // `i32::MIN` and `i32::MAX` would land on or above 100.
    let hash = hash.unsigned_abs().min(i32::MAX.unsigned_abs() - 1);
    f64::from(hash) / f64::from(i32::MAX) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_key() {
        assert_eq!(hash_code(""), 0);
        assert_eq!(score(""), 0.0);
    }

    #[test]
    fn test_short_keys_repeated() {
        assert_eq!(hash_code("ab"), hash_code("abababab"));
        assert_eq!(hash_code("abc"), hash_code("abcabcabcabc"));
        assert_ne!(hash_code("abcdefgh"), hash_code("abcdefghabcdefgh"));
    }

    #[test]
    fn test_known_hash() {
        // 5381 * 33 + 'a' repeated over "aaaaaaaa" in wrapping i32 arithmetic.
        let expected = (0..8).fold(5381i32, |h, _| h.wrapping_mul(33).wrapping_add(97));
        assert_eq!(hash_code("a"), expected);
    }

    #[test]
    fn test_utf16_units() {
        // A character outside the BMP contributes two surrogate units.
        let units: Vec<u16> = "😀".encode_utf16().collect();
        assert_eq!(units.len(), 2);
        assert_eq!(hash_code("😀"), hash_code("😀😀😀😀"));
    }

    #[test]
    fn test_score_range() {
        for key in ["user-1", "b8a2e1f0-9c2c-4b39-8f0e-9d6f3a1c2b7e", "x", "operation"] {
            let score = score(key);
            assert!((0.0..100.0).contains(&score), "{key}: {score}");
            assert_eq!(score, super::score(key));
        }
    }

    #[test]
    fn test_extreme_hashes_stay_below_hundred() {
        assert_eq!(normalize(0), 0.0);
        assert!(normalize(i32::MIN) < 100.0);
        assert!(normalize(i32::MAX) < 100.0);
        assert_eq!(normalize(i32::MIN), normalize(i32::MAX));
        assert!(normalize(-1000) > 0.0);
    }
}
