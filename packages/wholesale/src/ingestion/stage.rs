//! Stage decision logic for the ingestion pipeline (§4.B).
//!
//! These functions are the pure "decide what happens next" half of each
//! stage — the actual collaborator calls and repository reads/writes are
//! orchestrated by [`crate::worker`], which calls into this module the way
//! `relay`'s dispatcher calls into a `Machine::decide()`. Keeping the
//! decision logic here, free of I/O, is what makes the six seed scenarios
//! testable without a database or a live OCR provider.

use uuid::Uuid;

use crate::domain::{ArtifactStatus, ExtractedItem, MatchKind, NormalizedItem, Product};
use crate::error::StageError;
use crate::repository::{ProductCatalog, StoreError};

/// What a stage handler decided should happen next, on the success path.
/// Failure paths are carried by [`StageError`] instead — a handler returns
/// `Result<StageOutcome, StageError>`, matching §9's
/// `Ok(next_state) | SoftFail | HardFail | Transient` tagged union with
/// Rust's own `Result` rather than reinventing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Advanced(ArtifactStatus),
}

/// Guard before calling the extraction collaborator: an empty OCR text is a
/// stage-soft failure, not a hard one (§4.B EXTRACT "EMPTY_TEXT").
pub fn check_extract_input(raw_text: &str) -> Result<(), StageError> {
    if raw_text.trim().is_empty() {
        return Err(StageError::StageSoft {
            reason: "empty OCR text, nothing to extract".into(),
        });
    }
    Ok(())
}

/// Decide the artifact's next status once extraction + cleaning has
/// produced (possibly zero) items. Zero items is a stage-soft outcome
/// (§4.B "zero items -> PENDING_REVIEW not FAILED"), not a failure.
pub fn decide_after_extract(items: &[ExtractedItem]) -> StageOutcome {
    if items.is_empty() {
        StageOutcome::Advanced(ArtifactStatus::PendingReview)
    } else {
        StageOutcome::Advanced(ArtifactStatus::Extracted)
    }
}

/// Confidence for a PATTERN match: a substring/prefix hit scaled by how much
/// of the candidate's name the match covers (§4.B NORMALIZE "PATTERN").
fn pattern_confidence(needle: &str, candidate_name: &str) -> Option<f64> {
    let name_len = candidate_name.chars().count().max(1) as f64;
    let hit = needle.contains(candidate_name) || candidate_name.contains(needle);
    if !hit {
        return None;
    }
    let match_len = needle.chars().count().min(candidate_name.chars().count()) as f64;
    Some((0.8 + 0.2 * (match_len / name_len)).min(1.0))
}

/// Normalize one extracted item against the catalog, trying EXACT, then
/// PATTERN, then FUZZY in that order (§4.B NORMALIZE). `catalog` already
/// returns FUZZY candidates pre-scored by trigram similarity — the decision
/// here is purely which tier wins and whether the result clears
/// `match_threshold`.
pub async fn normalize_item(
    item: ExtractedItem,
    catalog: &dyn ProductCatalog,
    match_threshold: f64,
) -> Result<NormalizedItem, StoreError> {
    let needle = item.raw_name.to_lowercase();

    let name_like = catalog.find_by_name_like(&needle).await?;

    if let Some(exact) = name_like.iter().find(|p| is_exact_match(&needle, p)) {
        return Ok(finish(item, Some(exact.id), MatchKind::Exact, 1.0, match_threshold));
    }

    let best_pattern = name_like
        .iter()
        .filter_map(|p| {
            p.aliases
                .iter()
                .chain(std::iter::once(&p.canonical_name))
                .filter_map(|name| pattern_confidence(&needle, &name.to_lowercase()))
                .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|c| (p, c))
        })
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    if let Some((product, confidence)) = best_pattern {
        return Ok(finish(
            item,
            Some(product.id),
            MatchKind::Pattern,
            confidence,
            match_threshold,
        ));
    }

    let fuzzy = catalog.find_by_trigram_similarity(&needle, 5).await?;
    let best_fuzzy = fuzzy
        .into_iter()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    if let Some((product, similarity)) = best_fuzzy {
        return Ok(finish(
            item,
            Some(product.id),
            MatchKind::Fuzzy,
            similarity,
            match_threshold,
        ));
    }

    Ok(finish(item, None, MatchKind::None, 0.0, match_threshold))
}

fn is_exact_match(needle: &str, product: &Product) -> bool {
    product.canonical_name.to_lowercase() == needle
        || product
            .aliases
            .iter()
            .any(|alias| alias.to_lowercase() == needle)
}

fn finish(
    extracted: ExtractedItem,
    product_id: Option<Uuid>,
    match_kind: MatchKind,
    match_confidence: f64,
    match_threshold: f64,
) -> NormalizedItem {
    let clears_threshold = product_id.is_some() && match_confidence >= match_threshold;
    NormalizedItem {
        extracted,
        product_id: if clears_threshold { product_id } else { None },
        match_kind,
        match_confidence,
        needs_review: !clears_threshold,
    }
}

/// Decide the artifact's next status once every item has been normalized
/// (§4.B NORMALIZE "REVIEW_FRACTION_THRESHOLD"). Equal to the threshold
/// still proceeds — only strictly exceeding it routes to review.
pub fn decide_after_normalize(
    items: &[NormalizedItem],
    review_fraction_threshold: f64,
) -> StageOutcome {
    let total = items.len().max(1) as f64;
    let reviewable = items.iter().filter(|i| i.needs_review).count() as f64;
    if reviewable / total > review_fraction_threshold {
        StageOutcome::Advanced(ArtifactStatus::PendingReview)
    } else {
        StageOutcome::Advanced(ArtifactStatus::Normalized)
    }
}

/// Decide the artifact's next status once broadcast has run for every
/// confidently-normalized item. `rfq_counts_per_item` is how many RFQ rows
/// were produced per item (0 when NO_VENDORS_FOUND, §4.B BROADCAST).
pub fn decide_after_broadcast(rfq_counts_per_item: &[usize]) -> StageOutcome {
    if rfq_counts_per_item.is_empty() || rfq_counts_per_item.iter().all(|n| *n == 0) {
        StageOutcome::Advanced(ArtifactStatus::PendingReview)
    } else {
        StageOutcome::Advanced(ArtifactStatus::Broadcast)
    }
}

/// Decide the artifact's terminal status (§4.B FINALIZE): every
/// broadcast-eligible item must have produced at least one RFQ row.
pub fn decide_after_finalize(rfq_counts_per_item: &[usize]) -> StageOutcome {
    if !rfq_counts_per_item.is_empty() && rfq_counts_per_item.iter().all(|n| *n >= 1) {
        StageOutcome::Advanced(ArtifactStatus::Completed)
    } else {
        StageOutcome::Advanced(ArtifactStatus::PendingReview)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CanonicalUnit;
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    struct FakeCatalog {
        products: Vec<Product>,
        fuzzy: Vec<(Product, f64)>,
    }

    #[async_trait]
    impl ProductCatalog for FakeCatalog {
        async fn get(&self, id: Uuid) -> Result<Option<Product>, StoreError> {
            Ok(self.products.iter().find(|p| p.id == id).cloned())
        }

        async fn find_by_name_like(&self, needle: &str) -> Result<Vec<Product>, StoreError> {
            Ok(self
                .products
                .iter()
                .filter(|p| {
                    p.canonical_name.to_lowercase().contains(needle)
                        || needle.contains(&p.canonical_name.to_lowercase())
                })
                .cloned()
                .collect())
        }

        async fn find_by_trigram_similarity(
            &self,
            _needle: &str,
            _limit: usize,
        ) -> Result<Vec<(Product, f64)>, StoreError> {
            Ok(self.fuzzy.clone())
        }
    }

    fn item(name: &str) -> ExtractedItem {
        ExtractedItem {
            raw_name: name.to_string(),
            quantity: Decimal::from(10),
            unit: Some(CanonicalUnit::Kg),
            confidence: 0.9,
        }
    }

    fn product(name: &str) -> Product {
        Product {
            id: Uuid::new_v4(),
            canonical_name: name.to_string(),
            aliases: vec![],
            unit: Some(CanonicalUnit::Kg),
            category: "grocery".into(),
            search_vector: name.to_lowercase(),
        }
    }

    #[tokio::test]
    async fn exact_match_wins_with_full_confidence() {
        let rice = product("Rice");
        let catalog = FakeCatalog {
            products: vec![rice.clone()],
            fuzzy: vec![],
        };
        let normalized = normalize_item(item("Rice"), &catalog, 0.70).await.unwrap();
        assert_eq!(normalized.match_kind, MatchKind::Exact);
        assert_eq!(normalized.match_confidence, 1.0);
        assert_eq!(normalized.product_id, Some(rice.id));
        assert!(!normalized.needs_review);
    }

    #[tokio::test]
    async fn fuzzy_below_threshold_needs_review() {
        let xyz = product("Zyzfoo Blend");
        let catalog = FakeCatalog {
            products: vec![],
            fuzzy: vec![(xyz, 0.3)],
        };
        let normalized = normalize_item(item("xyzfoo"), &catalog, 0.70).await.unwrap();
        assert!(normalized.needs_review);
        assert_eq!(normalized.product_id, None);
    }

    #[test]
    fn review_fraction_equal_to_threshold_proceeds() {
        let items = vec![
            NormalizedItem {
                extracted: item("Rice"),
                product_id: Some(Uuid::new_v4()),
                match_kind: MatchKind::Fuzzy,
                match_confidence: 0.85,
                needs_review: false,
            },
            NormalizedItem {
                extracted: item("xyzfoo"),
                product_id: None,
                match_kind: MatchKind::None,
                match_confidence: 0.3,
                needs_review: true,
            },
        ];
        let outcome = decide_after_normalize(&items, 0.5);
        assert_eq!(outcome, StageOutcome::Advanced(ArtifactStatus::Normalized));
    }

    #[test]
    fn review_fraction_over_threshold_routes_to_review() {
        let items = vec![NormalizedItem {
            extracted: item("xyzfoo"),
            product_id: None,
            match_kind: MatchKind::None,
            match_confidence: 0.3,
            needs_review: true,
        }];
        let outcome = decide_after_normalize(&items, 0.5);
        assert_eq!(
            outcome,
            StageOutcome::Advanced(ArtifactStatus::PendingReview)
        );
    }

    #[test]
    fn broadcast_with_no_vendors_anywhere_routes_to_review() {
        assert_eq!(
            decide_after_broadcast(&[0, 0]),
            StageOutcome::Advanced(ArtifactStatus::PendingReview)
        );
    }

    #[test]
    fn finalize_requires_every_item_broadcast() {
        assert_eq!(
            decide_after_finalize(&[1, 0]),
            StageOutcome::Advanced(ArtifactStatus::PendingReview)
        );
        assert_eq!(
            decide_after_finalize(&[1, 3]),
            StageOutcome::Advanced(ArtifactStatus::Completed)
        );
    }
}
