use regex::Regex;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

/// The similarity threshold above which two normalized names are considered the same release.
pub const NAME_SIMILARITY_THRESHOLD: f64 = 0.6;

/// Zero-width characters which are stripped by the [NormalizeProfile::Loose] profile.
/// These frequently leak into release names through copy-pasted tracker pages.
const ZERO_WIDTH_CHARS: [char; 6] = [
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{200E}', '\u{200F}', '\u{FEFF}',
];

/// The normalization profile to apply to a filename or release name.
///
/// [NormalizeProfile::Strict] is used for exact equality checks which decide whether a
/// rename is needed, [NormalizeProfile::Loose] for fuzzy pairing between file lists.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NormalizeProfile {
    /// NFC folding only.
    Strict,
    /// NFKC folding, zero-width removal, whitespace collapsing and case folding.
    /// NFKC also unifies the Japanese half/full-width forms.
    Loose,
}

/// Canonicalize the given string for comparison.
///
/// This is the only place within the application that mutates strings for comparison,
/// all other components delegate to this function.
pub fn normalize(value: &str, profile: NormalizeProfile) -> String {
    match profile {
        NormalizeProfile::Strict => value.nfc().collect(),
        NormalizeProfile::Loose => {
            let stripped: String = value
                .chars()
                .filter(|e| !ZERO_WIDTH_CHARS.contains(e))
                .collect();
            let folded: String = stripped.nfkc().flat_map(|e| e.to_lowercase()).collect();

            collapse_whitespace(folded.as_str())
        }
    }
}

/// Calculate the similarity ratio between two normalized names.
///
/// The ratio is the length of the longest common substring divided by the length of the
/// longer input, which makes it resilient against added prefixes such as "Artist - ".
///
/// # Returns
///
/// Returns a ratio within `0.0..=1.0`.
pub fn similarity(left: &str, right: &str) -> f64 {
    let left: Vec<char> = left.chars().collect();
    let right: Vec<char> = right.chars().collect();
    let longest = left.len().max(right.len());

    if longest == 0 {
        return 1.0;
    }

    longest_common_substring(&left, &right) as f64 / longest as f64
}

/// Strip bracketed release tags (year, codec, source) from the given release name.
/// The remaining text is used as the search query towards target sites.
pub fn strip_release_tags(name: &str) -> String {
    static BRACKETS: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();

    let brackets = BRACKETS
        .get_or_init(|| Regex::new(r"[\[(\{]([^\])}]*)[\])}]").expect("expected a valid regex"));
    let tag = TAG.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:(?:19|20)\d{2}|flac|mp3|aac|alac|ape|v0|v2|320|256|192|web|cd|vinyl|sacd|dvd|tape|cassette|(?:16|24)\s*bit.*|lossless.*|scene|remaster.*)(?:[\s/+-]+(?:(?:19|20)\d{2}|flac|mp3|aac|alac|ape|v0|v2|320|256|192|web|cd|vinyl|sacd|dvd|tape|cassette|(?:16|24)\s*bit.*|lossless.*|scene|remaster.*))*$",
        )
        .expect("expected a valid regex")
    });

    let stripped = brackets.replace_all(name, |caps: &regex::Captures| {
        let inner = caps.get(1).map(|e| e.as_str().trim()).unwrap_or_default();
        if tag.is_match(inner) {
            String::new()
        } else {
            caps.get(0).unwrap().as_str().to_string()
        }
    });

    collapse_whitespace(stripped.as_ref())
}

fn collapse_whitespace(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut last_was_whitespace = false;

    for ch in value.chars() {
        if ch.is_whitespace() {
            if !last_was_whitespace && !result.is_empty() {
                result.push(' ');
            }
            last_was_whitespace = true;
        } else {
            result.push(ch);
            last_was_whitespace = false;
        }
    }

    while result.ends_with(' ') {
        result.pop();
    }

    result
}

fn longest_common_substring(left: &[char], right: &[char]) -> usize {
    if left.is_empty() || right.is_empty() {
        return 0;
    }

    // single row DP, previous diagonal kept in a scalar
    let mut row = vec![0usize; right.len() + 1];
    let mut longest = 0;

    for l in left {
        let mut diagonal = 0;
        for (i, r) in right.iter().enumerate() {
            let next_diagonal = row[i + 1];
            if l == r {
                row[i + 1] = diagonal + 1;
                longest = longest.max(row[i + 1]);
            } else {
                row[i + 1] = 0;
            }
            diagonal = next_diagonal;
        }
    }

    longest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_logger;

    #[test]
    fn test_normalize_strict() {
        init_logger!();
        // decomposed e + combining acute accent
        let value = "Sigur Ro\u{0301}s";

        let result = normalize(value, NormalizeProfile::Strict);

        assert_eq!("Sigur Rós", result);
    }

    #[test]
    fn test_normalize_loose_zero_width() {
        init_logger!();
        let value = "My\u{200B} Bloody\u{FEFF} Valentine";

        let result = normalize(value, NormalizeProfile::Loose);

        assert_eq!("my bloody valentine", result);
    }

    #[test]
    fn test_normalize_loose_width_folding() {
        init_logger!();
        let value = "ＹＭＯ　ライブ";

        let result = normalize(value, NormalizeProfile::Loose);

        assert_eq!("ymo ライブ", result);
    }

    #[test]
    fn test_normalize_loose_collapses_whitespace() {
        init_logger!();
        let value = "  Boards   of\tCanada  ";

        let result = normalize(value, NormalizeProfile::Loose);

        assert_eq!("boards of canada", result);
    }

    #[test]
    fn test_normalize_idempotent() {
        init_logger!();
        let values = ["Sigur Ro\u{0301}s", "ＡＢＣ\u{200B} ｄｅｆ", "01 - Track.flac"];

        for value in values {
            for profile in [NormalizeProfile::Strict, NormalizeProfile::Loose] {
                let once = normalize(value, profile);
                let twice = normalize(once.as_str(), profile);
                assert_eq!(once, twice, "expected normalize to be idempotent");
            }
        }
    }

    #[test]
    fn test_similarity() {
        init_logger!();
        assert_eq!(1.0, similarity("same", "same"));
        assert_eq!(1.0, similarity("", ""));
        assert_eq!(0.0, similarity("abc", "xyz"));

        let result = similarity("01 - track.flac", "artist - 01 - track.flac");
        assert!(
            result >= NAME_SIMILARITY_THRESHOLD,
            "expected {} to be above the threshold",
            result
        );
    }

    #[test]
    fn test_strip_release_tags() {
        init_logger!();
        assert_eq!(
            "Artist - Album",
            strip_release_tags("Artist - Album (2020) [FLAC] [24bit Lossless]")
        );
        assert_eq!(
            "Artist - Album (Deluxe Edition)",
            strip_release_tags("Artist - Album (Deluxe Edition) [WEB]")
        );
        assert_eq!(
            "Album [2020 FLAC",
            strip_release_tags("Album [2020 FLAC"),
            "expected unbalanced brackets to be left alone"
        );
    }
}
