//! Spelled-number parsing ("one" through "twenty"), used by the cleaning
//! pass (§4.B cleaning rule ii) when the extractor returns a word instead
//! of a numeral.

use rust_decimal::Decimal;

const WORDS: &[(&str, i64)] = &[
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
    ("seven", 7),
    ("eight", 8),
    ("nine", 9),
    ("ten", 10),
    ("eleven", 11),
    ("twelve", 12),
    ("thirteen", 13),
    ("fourteen", 14),
    ("fifteen", 15),
    ("sixteen", 16),
    ("seventeen", 17),
    ("eighteen", 18),
    ("nineteen", 19),
    ("twenty", 20),
];

/// Parses a spelled-out number up to twenty, case-insensitively. Returns
/// `None` for anything else — callers fall back to numeric/fraction parsing.
pub fn parse_spelled(word: &str) -> Option<Decimal> {
    let lower = word.trim().to_lowercase();
    WORDS
        .iter()
        .find(|(w, _)| *w == lower)
        .map(|(_, n)| Decimal::from(*n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_words() {
        assert_eq!(parse_spelled("one"), Some(Decimal::from(1)));
        assert_eq!(parse_spelled("Twenty"), Some(Decimal::from(20)));
        assert_eq!(parse_spelled("NINETEEN"), Some(Decimal::from(19)));
    }

    #[test]
    fn rejects_unknown_words() {
        assert_eq!(parse_spelled("twenty-one"), None);
        assert_eq!(parse_spelled("dozen"), None);
        assert_eq!(parse_spelled(""), None);
    }
}
