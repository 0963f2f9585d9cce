//! Vendor Selector (§4.C): eligibility filtering, composite scoring, and
//! deterministic ranking/splitting across the top-K vendors for a requested
//! item.

use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use uuid::Uuid;

use crate::config::SelectorWeights;
use crate::domain::{Vendor, VendorMetrics, VendorProduct};

/// One vendor considered for a requested `(product_id, quantity)`, already
/// known to carry the product.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub vendor: Vendor,
    pub offer: VendorProduct,
    pub metrics: VendorMetrics,
}

/// A scored, ranked candidate — what the decision log and the RFQ rows are
/// built from.
#[derive(Debug, Clone, Serialize)]
pub struct RankedVendor {
    pub vendor_id: Uuid,
    pub score: f64,
    pub rank: u32,
}

/// Why a candidate was excluded before scoring, for the decision log.
///
/// No `NotCarried` variant: a vendor that doesn't carry the requested
/// product never becomes a [`Candidate`] in the first place (the catalog
/// query that builds the candidate set is already scoped to offers of that
/// product), so there is nothing for this filter to exclude or log for that
/// reason — it's decided upstream of `filter_eligible`, by the query shape.
#[derive(Debug, Clone, Serialize)]
pub enum Ineligibility {
    Inactive,
    Unavailable,
    InsufficientStock,
    OutsideWorkingHours,
    BelowMinReliability,
}

/// Full record of one selection run, required by §4.C "Decision logging".
#[derive(Debug, Clone, Serialize)]
pub struct SelectionDecision {
    pub product_id: Uuid,
    pub requested_qty_minute_of_day: Option<u16>,
    pub weights: SelectorWeights,
    pub excluded: Vec<(Uuid, Ineligibility)>,
    pub ranked: Vec<RankedVendor>,
    pub chosen: Vec<Uuid>,
}

/// Eligibility filter (§4.C "Eligibility"). `quantity` and `now_minute_of_day`
/// describe the request; `min_reliability`/`seed_samples` come from config.
pub fn filter_eligible(
    candidates: Vec<Candidate>,
    quantity: rust_decimal::Decimal,
    now_minute_of_day: u16,
    min_reliability: f64,
    seed_samples: u64,
) -> (Vec<Candidate>, Vec<(Uuid, Ineligibility)>) {
    let mut eligible = Vec::new();
    let mut excluded = Vec::new();

    for c in candidates {
        if !c.vendor.active {
            excluded.push((c.vendor.id, Ineligibility::Inactive));
            continue;
        }
        if !c.offer.available {
            excluded.push((c.vendor.id, Ineligibility::Unavailable));
            continue;
        }
        if c.offer.stock < quantity {
            excluded.push((c.vendor.id, Ineligibility::InsufficientStock));
            continue;
        }
        if let Some(hours) = c.vendor.working_hours {
            if !hours.contains(now_minute_of_day) {
                excluded.push((c.vendor.id, Ineligibility::OutsideWorkingHours));
                continue;
            }
        }
        // Vendors with too little history auto-pass the reliability gate
        // (§4.C "vendor auto-passes if samples_n < SEED_SAMPLES").
        if c.metrics.samples_n >= seed_samples && c.metrics.reliability_score < min_reliability {
            excluded.push((c.vendor.id, Ineligibility::BelowMinReliability));
            continue;
        }
        eligible.push(c);
    }

    (eligible, excluded)
}

/// Composite score `S` (§4.C formula). `price_min`/`price_max` are taken
/// across the full eligible candidate set for this item.
pub fn score(
    candidate: &Candidate,
    weights: &SelectorWeights,
    price_min: rust_decimal::Decimal,
    price_max: rust_decimal::Decimal,
) -> f64 {
    let reliability = candidate.metrics.reliability_score / 100.0;

    let price = candidate.offer.price.to_f64().unwrap_or(0.0);
    let p_min = price_min.to_f64().unwrap_or(0.0);
    let p_max = price_max.to_f64().unwrap_or(0.0);
    let spread = (p_max - p_min).max(f64::EPSILON);
    let price_score = if price_max == price_min {
        1.0
    } else {
        1.0 - (price - p_min) / spread
    };

    let fulfillment = candidate.metrics.delivery_success_rate;

    // No responses recorded yet reads as "missing" (§4.C response_score),
    // since the row carries no observed response time to score.
    let response_score = if candidate.metrics.responded_n == 0 {
        0.5
    } else {
        (-candidate.metrics.avg_response_time_seconds / 1800.0).exp()
    };

    weights.w_rel * reliability
        + weights.w_price * price_score
        + weights.w_ful * fulfillment
        + weights.w_resp * response_score
}

/// Rank eligible candidates descending by score, breaking ties by (1) higher
/// reliability, (2) lower price, (3) vendor id (§4.C "Ordering").
pub fn rank(
    candidates: &[Candidate],
    weights: &SelectorWeights,
) -> Vec<(Candidate, f64)> {
    let price_min = candidates
        .iter()
        .map(|c| c.offer.price)
        .min()
        .unwrap_or_default();
    let price_max = candidates
        .iter()
        .map(|c| c.offer.price)
        .max()
        .unwrap_or_default();

    let mut scored: Vec<(Candidate, f64)> = candidates
        .iter()
        .map(|c| (c.clone(), score(c, weights, price_min, price_max)))
        .collect();

    scored.sort_by(|(ca, sa), (cb, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                cb.metrics
                    .reliability_score
                    .partial_cmp(&ca.metrics.reliability_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| ca.offer.price.cmp(&cb.offer.price))
            .then_with(|| ca.vendor.id.cmp(&cb.vendor.id))
    });

    scored
}

/// Select the top `top_k` vendors for one requested item, producing both the
/// ranked list (for RFQ rows) and the full decision record (for the log).
pub fn select_top_k(
    product_id: Uuid,
    candidates: Vec<Candidate>,
    quantity: rust_decimal::Decimal,
    now_minute_of_day: u16,
    top_k: usize,
    min_reliability: f64,
    seed_samples: u64,
    weights: &SelectorWeights,
) -> SelectionDecision {
    let (eligible, excluded) = filter_eligible(
        candidates,
        quantity,
        now_minute_of_day,
        min_reliability,
        seed_samples,
    );

    let scored = rank(&eligible, weights);

    let ranked: Vec<RankedVendor> = scored
        .iter()
        .enumerate()
        .map(|(i, (c, s))| RankedVendor {
            vendor_id: c.vendor.id,
            score: *s,
            rank: (i + 1) as u32,
        })
        .collect();

    let chosen: Vec<Uuid> = ranked.iter().take(top_k).map(|r| r.vendor_id).collect();

    SelectionDecision {
        product_id,
        requested_qty_minute_of_day: Some(now_minute_of_day),
        weights: weights.clone(),
        excluded,
        ranked,
        chosen,
    }
}

/// One vendor's share of a multi-item order, grouped from several per-item
/// [`SelectionDecision`]s (§4.C "Order splitting").
#[derive(Debug, Clone, Serialize)]
pub struct VendorShare {
    pub vendor_id: Uuid,
    pub product_ids: Vec<Uuid>,
}

/// Groups items by the vendor each one's top-ranked (rank 1) candidate is,
/// into `{vendor_id, items[]}` shares — "unioning items that share the
/// top-ranked vendor" (§4.C "Order splitting", singular: the winner, not
/// every vendor in the top-K an item was broadcast to). Deterministic:
/// iterates items in the order given, so the same inputs always produce the
/// same grouping (§4.C "must be deterministic").
pub fn group_by_vendor(decisions: &[SelectionDecision]) -> Vec<VendorShare> {
    let mut shares: Vec<VendorShare> = Vec::new();

    for decision in decisions {
        let Some(&top_vendor_id) = decision.chosen.first() else {
            continue;
        };
        if let Some(share) = shares.iter_mut().find(|s| s.vendor_id == top_vendor_id) {
            share.product_ids.push(decision.product_id);
        } else {
            shares.push(VendorShare {
                vendor_id: top_vendor_id,
                product_ids: vec![decision.product_id],
            });
        }
    }

    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Vendor, VendorProduct};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn vendor(id: Uuid, active: bool) -> Vendor {
        Vendor {
            id,
            active,
            working_hours: None,
            service_radius_km: None,
            location: None,
        }
    }

    fn offer(vendor_id: Uuid, product_id: Uuid, price: i64, stock: i64) -> VendorProduct {
        VendorProduct {
            vendor_id,
            product_id,
            price: Decimal::from(price),
            stock: Decimal::from(stock),
            available: true,
            last_restocked_at: Some(Utc::now()),
        }
    }

    fn candidate(price: i64, reliability: f64, delivery: f64) -> Candidate {
        let vendor_id = Uuid::new_v4();
        let product_id = Uuid::new_v4();
        Candidate {
            vendor: vendor(vendor_id, true),
            offer: offer(vendor_id, product_id, price, 100),
            metrics: VendorMetrics {
                vendor_id,
                reliability_score: reliability,
                acceptance_rate: 0.9,
                delivery_success_rate: delivery,
                avg_response_time_seconds: 300.0,
                cancellation_rate: 0.01,
                price_vs_market_percent: None,
                samples_n: 50,
                last_updated: Utc::now(),
                assigned_n: 50,
                responded_n: 45,
                accepted_n: 45,
                delivered_n: 40,
                delivered_ok_n: 38,
                cancelled_by_vendor_n: 1,
                response_time_sum_seconds: 13500.0,
            },
        }
    }

    #[test]
    fn cheaper_vendor_scores_higher_when_reliability_ties() {
        let weights = SelectorWeights::default();
        let cheap = candidate(10, 80.0, 0.9);
        let pricey = candidate(20, 80.0, 0.9);
        let price_min = cheap.offer.price.min(pricey.offer.price);
        let price_max = cheap.offer.price.max(pricey.offer.price);
        let s_cheap = score(&cheap, &weights, price_min, price_max);
        let s_pricey = score(&pricey, &weights, price_min, price_max);
        assert!(s_cheap > s_pricey);
    }

    #[test]
    fn ineligible_vendors_are_excluded_not_scored() {
        let inactive = candidate(10, 90.0, 0.9);
        let mut inactive = inactive;
        inactive.vendor.active = false;
        let (eligible, excluded) = filter_eligible(
            vec![inactive],
            Decimal::from(1),
            600,
            60.0,
            10,
        );
        assert!(eligible.is_empty());
        assert_eq!(excluded.len(), 1);
    }

    #[test]
    fn group_by_vendor_is_deterministic_across_items() {
        let v1 = Uuid::new_v4();
        let v2 = Uuid::new_v4();
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let d1 = SelectionDecision {
            product_id: p1,
            requested_qty_minute_of_day: None,
            weights: SelectorWeights::default(),
            excluded: vec![],
            ranked: vec![],
            chosen: vec![v1, v2],
        };
        let d2 = SelectionDecision {
            product_id: p2,
            requested_qty_minute_of_day: None,
            weights: SelectorWeights::default(),
            excluded: vec![],
            ranked: vec![],
            chosen: vec![v1],
        };
        let shares = group_by_vendor(&[d1, d2]);
        let v1_share = shares.iter().find(|s| s.vendor_id == v1).unwrap();
        assert_eq!(v1_share.product_ids, vec![p1, p2]);

        // v2 was only ever ranked #2 on p1, never the top-ranked vendor for
        // any item, so it gets no share even though it was broadcast p1.
        assert!(shares.iter().all(|s| s.vendor_id != v2));
    }
}
