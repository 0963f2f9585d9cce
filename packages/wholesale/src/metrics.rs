//! Vendor Performance Store (§4.D): pure application of lifecycle events to
//! [`VendorMetrics`], independent of how the row is persisted (see
//! [`crate::repository::VendorMetricsStore`] for the durable side).

use crate::config::MetricsWeights;
use crate::domain::{VendorLifecycleEvent, VendorMetrics, VendorResponse};

/// Fold one lifecycle event into a metrics row, returning the updated row.
/// Pure and total: callers are responsible for the `event_id` idempotence
/// check (§8 idempotence law — the same event applied twice must leave the
/// same state as applying it once) before calling this.
pub fn apply_event(
    mut metrics: VendorMetrics,
    event: &VendorLifecycleEvent,
    at_market_price_percentile: Option<f64>,
    response_time_seconds: Option<f64>,
) -> VendorMetrics {
    match event {
        VendorLifecycleEvent::Assigned { at, .. } => {
            metrics.assigned_n += 1;
            metrics.last_updated = *at;
        }
        VendorLifecycleEvent::Responded { response, at, .. } => {
            metrics.responded_n += 1;
            if *response == VendorResponse::Accept {
                metrics.accepted_n += 1;
            }
            if let Some(elapsed) = response_time_seconds {
                metrics.response_time_sum_seconds += elapsed.max(0.0);
            }
            metrics.last_updated = *at;
        }
        VendorLifecycleEvent::Delivered { success, at, .. } => {
            metrics.delivered_n += 1;
            if *success {
                metrics.delivered_ok_n += 1;
            }
            metrics.last_updated = *at;
        }
        VendorLifecycleEvent::Cancelled { by_vendor, at, .. } => {
            if *by_vendor {
                metrics.cancelled_by_vendor_n += 1;
            }
            metrics.last_updated = *at;
        }
    }

    recompute_derived(&mut metrics, at_market_price_percentile);
    metrics
}

/// Recompute the derived rates and the composite `reliability_score` from
/// the raw counters (§4.D "Derived rates", "Composite").
fn recompute_derived(metrics: &mut VendorMetrics, price_percentile: Option<f64>) {
    let assigned = metrics.assigned_n.max(1) as f64;
    let responded = metrics.responded_n.max(1) as f64;
    let delivered = metrics.delivered_n.max(1) as f64;

    metrics.acceptance_rate = metrics.accepted_n as f64 / assigned;
    metrics.delivery_success_rate = metrics.delivered_ok_n as f64 / delivered;
    metrics.cancellation_rate = metrics.cancelled_by_vendor_n as f64 / assigned;
    metrics.avg_response_time_seconds = metrics.response_time_sum_seconds / responded;

    if let Some(p) = price_percentile {
        metrics.price_vs_market_percent = Some(p);
    }

    metrics.samples_n = metrics.assigned_n;
}

/// Composite `reliability_score` with cold-start blending (§4.D "Cold-start").
///
/// `seed_samples` is the `SEED_SAMPLES` config threshold; below it the score
/// blends the observed composite with a neutral 0.75 prior proportional to
/// how many samples have actually been observed.
pub fn reliability_score(metrics: &VendorMetrics, weights: &MetricsWeights, seed_samples: u64) -> f64 {
    let response_term = if metrics.responded_n == 0 {
        0.5
    } else {
        (-metrics.avg_response_time_seconds / 1800.0).exp()
    };

    // price_term is the flipped market-price percentile; 0 when unknown
    // (§4.D "0 if unknown"), not a neutral default — `None` is the only
    // thing that reads as unknown, a `0.0` reading is a real best-in-market
    // observation and must score the maximum price_term of 1.0.
    let price_term = match metrics.price_vs_market_percent {
        Some(p) if p.is_finite() => 1.0 - p.clamp(0.0, 1.0),
        _ => 0.0,
    };

    let observed = (weights.w1_acceptance * metrics.acceptance_rate
        + weights.w2_delivery * metrics.delivery_success_rate
        + weights.w3_response * response_term
        + weights.w4_cancellation * (1.0 - metrics.cancellation_rate)
        + weights.w5_price * price_term)
        .clamp(0.0, 1.0);

    let observed = observed * 100.0;

    if metrics.assigned_n >= seed_samples {
        observed
    } else {
        let alpha = metrics.assigned_n as f64 / seed_samples as f64;
        alpha * observed + (1.0 - alpha) * 75.0
    }
}

/// Applies an event and writes the resulting `reliability_score` into the
/// row (§9 Open Question: the score is pinned at write time, reads never
/// recompute it).
pub fn apply_and_score(
    metrics: VendorMetrics,
    event: &VendorLifecycleEvent,
    weights: &MetricsWeights,
    seed_samples: u64,
    price_percentile: Option<f64>,
    response_time_seconds: Option<f64>,
) -> VendorMetrics {
    let mut metrics = apply_event(metrics, event, price_percentile, response_time_seconds);
    metrics.reliability_score = reliability_score(&metrics, weights, seed_samples);
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn assigned_event(vendor_id: uuid::Uuid) -> VendorLifecycleEvent {
        VendorLifecycleEvent::Assigned {
            event_id: Uuid::new_v4(),
            vendor_id,
            order_id: Uuid::new_v4(),
            at: Utc::now(),
        }
    }

    #[test]
    fn assigned_event_increments_counter_and_samples() {
        let vendor_id = Uuid::new_v4();
        let metrics = VendorMetrics::seed(vendor_id);
        let updated = apply_event(metrics, &assigned_event(vendor_id), None, None);
        assert_eq!(updated.assigned_n, 1);
        assert_eq!(updated.samples_n, 1);
    }

    #[test]
    fn cold_start_blends_toward_neutral_prior() {
        let vendor_id = Uuid::new_v4();
        let metrics = VendorMetrics::seed(vendor_id);
        let weights = MetricsWeights::default();
        let updated = apply_event(metrics, &assigned_event(vendor_id), None, None);
        let score = reliability_score(&updated, &weights, 10);
        // 1 of 10 seed samples observed; should sit close to the 75 prior.
        assert!((70.0..=76.0).contains(&score), "score was {score}");
    }

    #[test]
    fn two_delivered_events_compound_counters() {
        let vendor_id = Uuid::new_v4();
        let mut metrics = VendorMetrics::seed(vendor_id);
        for _ in 0..2 {
            let event = VendorLifecycleEvent::Delivered {
                event_id: Uuid::new_v4(),
                vendor_id,
                order_id: Uuid::new_v4(),
                at: Utc::now(),
                success: true,
            };
            metrics = apply_event(metrics, &event, None, None);
        }
        assert_eq!(metrics.delivered_n, 2);
        assert_eq!(metrics.delivered_ok_n, 2);
        assert_eq!(metrics.delivery_success_rate, 1.0);
    }

    #[test]
    fn responded_event_accumulates_response_time() {
        let vendor_id = Uuid::new_v4();
        let metrics = VendorMetrics::seed(vendor_id);
        let event = VendorLifecycleEvent::Responded {
            event_id: Uuid::new_v4(),
            vendor_id,
            order_id: Uuid::new_v4(),
            at: Utc::now(),
            response: VendorResponse::Accept,
        };
        let updated = apply_event(metrics, &event, None, Some(120.0));
        assert_eq!(updated.responded_n, 1);
        assert_eq!(updated.accepted_n, 1);
        assert_eq!(updated.response_time_sum_seconds, 120.0);
        assert_eq!(updated.avg_response_time_seconds, 120.0);
    }
}
