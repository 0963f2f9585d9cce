//! Cleaning rules applied to raw extraction records before they become
//! [`ExtractedItem`]s (§4.B "Cleaning rules").

use std::collections::HashMap;
use std::str::FromStr;

use once_cell::sync::Lazy;
use rust_decimal::Decimal;

use crate::domain::{CanonicalUnit, ExtractedItem};
use crate::error::StageError;

use super::quantity::parse_spelled;

/// Fixed unit alias table (GLOSSARY "Unit alias map"). Unknown tokens map
/// to `None` rather than being rejected — an item with no recognizable
/// unit is still a valid line item per §3 ExtractedItem (`unit` nullable).
static UNIT_ALIASES: Lazy<HashMap<&'static str, CanonicalUnit>> = Lazy::new(|| {
    use CanonicalUnit::*;
    HashMap::from([
        ("kg", Kg),
        ("kgs", Kg),
        ("kilogram", Kg),
        ("kilo", Kg),
        ("g", G),
        ("gm", G),
        ("gram", G),
        ("grams", G),
        ("l", L),
        ("litre", L),
        ("liter", L),
        ("ml", Ml),
        ("millilitre", Ml),
        ("piece", Piece),
        ("pc", Piece),
        ("pcs", Piece),
        ("packet", Packet),
        ("pack", Packet),
        ("dozen", Dozen),
        ("doz", Dozen),
        ("bottle", Bottle),
        ("box", Box),
    ])
});

fn normalize_unit(raw: &str) -> Option<CanonicalUnit> {
    UNIT_ALIASES.get(raw.trim().to_lowercase().as_str()).copied()
}

/// Trim, collapse internal whitespace, strip surrounding punctuation; title
/// case the display form. Returns `None` if the post-clean name is empty
/// (§4.B cleaning rule i: "reject entries with empty post-clean name").
fn clean_name(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed
        .trim_matches(|c: char| c.is_ascii_punctuation() && c != '\'')
        .to_string();
    if trimmed.is_empty() {
        return None;
    }
    Some(title_case(&trimmed))
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse an integer, decimal, simple fraction (`a/b`), or spelled number.
fn parse_quantity(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => {
            Decimal::from_str(&n.to_string()).ok()
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(d) = Decimal::from_str(s) {
                return Some(d);
            }
            if let Some((num, den)) = s.split_once('/') {
                let num: Decimal = num.trim().parse().ok()?;
                let den: Decimal = den.trim().parse().ok()?;
                if den != Decimal::ZERO {
                    return Some(num / den);
                }
                return None;
            }
            parse_spelled(s)
        }
        _ => None,
    }
}

/// Convert a gram-scale or millilitre-scale quantity up to its kg/l form
/// (§4.B cleaning rule iii: "500 g -> 0.5 kg").
fn rescale(quantity: Decimal, unit: Option<CanonicalUnit>) -> (Decimal, Option<CanonicalUnit>) {
    match unit {
        Some(CanonicalUnit::G) => (quantity / Decimal::new(1000, 0), Some(CanonicalUnit::Kg)),
        Some(CanonicalUnit::Ml) => (quantity / Decimal::new(1000, 0), Some(CanonicalUnit::L)),
        other => (quantity, other),
    }
}

/// Clean one raw record into an [`ExtractedItem`], or reject it.
///
/// Rejections are always [`StageError::ContractViolation`]: per §7, a
/// record that fails the contract is dropped, the artifact is not failed.
pub fn clean_record(
    raw: &crate::collaborators::RawExtractedRecord,
    max_quantity: Decimal,
) -> Result<ExtractedItem, StageError> {
    let name = raw
        .name
        .as_deref()
        .ok_or_else(|| violation("missing name"))?;
    let name = clean_name(name).ok_or_else(|| violation("empty post-clean name"))?;

    let quantity = raw
        .quantity
        .as_ref()
        .and_then(parse_quantity)
        .ok_or_else(|| violation("missing or unparseable quantity"))?;

    if quantity <= Decimal::ZERO {
        return Err(violation("quantity must be > 0"));
    }
    if quantity > max_quantity {
        return Err(violation("quantity exceeds configured cap"));
    }

    let unit = raw.unit.as_deref().and_then(normalize_unit);
    let (quantity, unit) = rescale(quantity, unit);

    let confidence = raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0);

    Ok(ExtractedItem {
        raw_name: name,
        quantity,
        unit,
        confidence,
    })
}

/// Merge items sharing `(lowercased_name, canonical_unit)` by summing
/// quantities; merged confidence is the max of the inputs (§4.B cleaning
/// rule iv).
pub fn merge_duplicates(items: Vec<ExtractedItem>) -> Vec<ExtractedItem> {
    let mut merged: Vec<ExtractedItem> = Vec::new();
    for item in items {
        let key = (item.raw_name.to_lowercase(), item.unit);
        if let Some(existing) = merged
            .iter_mut()
            .find(|m| (m.raw_name.to_lowercase(), m.unit) == key)
        {
            existing.quantity += item.quantity;
            existing.confidence = existing.confidence.max(item.confidence);
        } else {
            merged.push(item);
        }
    }
    merged
}

fn violation(detail: &str) -> StageError {
    StageError::ContractViolation {
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::RawExtractedRecord;
    use serde_json::json;

    fn record(name: &str, qty: serde_json::Value, unit: Option<&str>, conf: f64) -> RawExtractedRecord {
        RawExtractedRecord {
            name: Some(name.to_string()),
            quantity: Some(qty),
            unit: unit.map(str::to_string),
            confidence: Some(conf),
        }
    }

    #[test]
    fn cleans_numeric_quantity_and_unit() {
        let r = record("  rice  ", json!(10), Some("kg"), 0.9);
        let item = clean_record(&r, Decimal::new(10_000, 0)).unwrap();
        assert_eq!(item.raw_name, "Rice");
        assert_eq!(item.quantity, Decimal::from(10));
        assert_eq!(item.unit, Some(CanonicalUnit::Kg));
    }

    #[test]
    fn rescales_grams_to_kilograms() {
        let r = record("Oil", json!(500), Some("g"), 0.8);
        let item = clean_record(&r, Decimal::new(10_000, 0)).unwrap();
        assert_eq!(item.quantity, Decimal::new(5, 1)); // 0.5
        assert_eq!(item.unit, Some(CanonicalUnit::Kg));
    }

    #[test]
    fn parses_spelled_numbers() {
        let r = record("Sugar", json!("two"), Some("kg"), 0.7);
        let item = clean_record(&r, Decimal::new(10_000, 0)).unwrap();
        assert_eq!(item.quantity, Decimal::from(2));
    }

    #[test]
    fn parses_simple_fractions() {
        let r = record("Butter", json!("1/2"), Some("kg"), 0.7);
        let item = clean_record(&r, Decimal::new(10_000, 0)).unwrap();
        assert_eq!(item.quantity, Decimal::new(5, 1));
    }

    #[test]
    fn rejects_zero_or_negative_quantity() {
        let r = record("Rice", json!(0), Some("kg"), 0.9);
        assert!(clean_record(&r, Decimal::new(10_000, 0)).is_err());
    }

    #[test]
    fn rejects_quantity_over_cap() {
        let r = record("Rice", json!(20_000), Some("kg"), 0.9);
        assert!(clean_record(&r, Decimal::new(10_000, 0)).is_err());
    }

    #[test]
    fn unknown_unit_normalizes_to_none() {
        let r = record("Mystery Item", json!(3), Some("bushel"), 0.5);
        let item = clean_record(&r, Decimal::new(10_000, 0)).unwrap();
        assert_eq!(item.unit, None);
    }

    #[test]
    fn merges_duplicates_by_name_and_unit() {
        let items = vec![
            ExtractedItem {
                raw_name: "Rice".into(),
                quantity: Decimal::from(2),
                unit: Some(CanonicalUnit::Kg),
                confidence: 0.6,
            },
            ExtractedItem {
                raw_name: "rice".into(),
                quantity: Decimal::from(3),
                unit: Some(CanonicalUnit::Kg),
                confidence: 0.9,
            },
        ];
        let merged = merge_duplicates(items);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].quantity, Decimal::from(5));
        assert_eq!(merged[0].confidence, 0.9);
    }
}
