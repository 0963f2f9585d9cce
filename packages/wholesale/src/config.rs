//! Operator-facing configuration surface (§6 "Configuration surface").

use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use rust_decimal::Decimal;
use serde::Serialize;
use std::env;
use std::str::FromStr;

/// Weights for the vendor selector's composite score (§4.C).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SelectorWeights {
    pub w_rel: f64,
    pub w_price: f64,
    pub w_ful: f64,
    pub w_resp: f64,
}

impl Default for SelectorWeights {
    fn default() -> Self {
        Self {
            w_rel: 0.40,
            w_price: 0.30,
            w_ful: 0.20,
            w_resp: 0.10,
        }
    }
}

impl SelectorWeights {
    fn validate(&self) -> Result<()> {
        let sum = self.w_rel + self.w_price + self.w_ful + self.w_resp;
        if (sum - 1.0).abs() > 0.01 {
            bail!("selector weights must sum to 1.0 +/- 0.01, got {sum}");
        }
        Ok(())
    }
}

/// Weights for the vendor performance store's composite score (§4.D).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsWeights {
    pub w1_acceptance: f64,
    pub w2_delivery: f64,
    pub w3_response: f64,
    pub w4_cancellation: f64,
    pub w5_price: f64,
}

impl Default for MetricsWeights {
    fn default() -> Self {
        Self {
            w1_acceptance: 0.20,
            w2_delivery: 0.25,
            w3_response: 0.25,
            w4_cancellation: 0.10,
            w5_price: 0.20,
        }
    }
}

impl MetricsWeights {
    fn validate(&self) -> Result<()> {
        let sum = self.w1_acceptance
            + self.w2_delivery
            + self.w3_response
            + self.w4_cancellation
            + self.w5_price;
        if (sum - 1.0).abs() > 0.01 {
            bail!("metrics weights must sum to 1.0 +/- 0.01, got {sum}");
        }
        Ok(())
    }
}

/// Per-queue tuning, overriding `relay`'s own per-queue defaults (§4.A).
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub job_timeout: Duration,
    pub max_attempts: i32,
    pub base_backoff: Duration,
    pub cap_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            job_timeout: Duration::from_secs(30),
            max_attempts: 3,
            base_backoff: Duration::from_secs(5),
            cap_backoff: Duration::from_secs(600),
        }
    }
}

/// Full operator-tunable surface for the wholesale core (§6).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub match_threshold: f64,
    pub review_fraction_threshold: f64,
    pub top_k_vendors: usize,
    pub min_reliability: f64,
    pub seed_samples: u64,
    pub max_quantity: rust_decimal::Decimal,

    pub selector_weights: SelectorWeights,
    pub metrics_weights: MetricsWeights,

    pub ingestion_queue: QueueConfig,
    pub outbox_relay_queue: QueueConfig,
    pub maintenance_queue: QueueConfig,

    /// Per-provider token-bucket rate (§5 "per-provider rate limits"), in
    /// requests per minute.
    pub ocr_requests_per_minute: u32,
    pub extraction_requests_per_minute: u32,

    /// Only the *seed* value written to `safe_mode_gate` the first time a
    /// process boots against a fresh database (§5 "a single row readable
    /// by all processes"). Flipping it afterwards is an admin operation
    /// against that row (`SafeModeGate::set_engaged`), not a redeploy with
    /// a different env var — live reads go through
    /// [`crate::worker::SafeModeCache`], never this field.
    pub safe_mode: bool,
}

impl Config {
    /// Load configuration from environment variables, matching every
    /// `relay`-consuming binary's `Config::from_env()` convention: required
    /// keys fail loudly with context, optional keys fall back to the
    /// defaults §6 enumerates.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let selector_weights = SelectorWeights {
            w_rel: env_f64("SELECTOR_W_REL", 0.40)?,
            w_price: env_f64("SELECTOR_W_PRICE", 0.30)?,
            w_ful: env_f64("SELECTOR_W_FUL", 0.20)?,
            w_resp: env_f64("SELECTOR_W_RESP", 0.10)?,
        };
        selector_weights.validate()?;

        let metrics_weights = MetricsWeights {
            w1_acceptance: env_f64("METRICS_W1_ACCEPTANCE", 0.20)?,
            w2_delivery: env_f64("METRICS_W2_DELIVERY", 0.25)?,
            w3_response: env_f64("METRICS_W3_RESPONSE", 0.25)?,
            w4_cancellation: env_f64("METRICS_W4_CANCELLATION", 0.10)?,
            w5_price: env_f64("METRICS_W5_PRICE", 0.20)?,
        };
        metrics_weights.validate()?;

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,

            match_threshold: env_f64("MATCH_THRESHOLD", 0.70)?,
            review_fraction_threshold: env_f64("REVIEW_FRACTION_THRESHOLD", 0.5)?,
            top_k_vendors: env_usize("TOP_K_VENDORS", 5)?,
            min_reliability: env_f64("MIN_RELIABILITY", 60.0)?,
            seed_samples: env_usize("SEED_SAMPLES", 10)? as u64,
            max_quantity: env_decimal("MAX_QUANTITY", Decimal::new(10_000, 0))?,

            selector_weights,
            metrics_weights,

            ingestion_queue: queue_config_from_env("INGESTION_QUEUE", QueueConfig::default())?,
            // Batch size defaults to the relay's own hardcoded sweep size
            // (100 rows/sweep) rather than `QueueConfig::default()`'s
            // per-job `concurrency` of 4, since a relay sweep claims a
            // batch rather than running N handlers at once.
            outbox_relay_queue: queue_config_from_env(
                "OUTBOX_RELAY_QUEUE",
                QueueConfig {
                    concurrency: 100,
                    ..QueueConfig::default()
                },
            )?,
            // `job_timeout` here is read as the sweep interval (the
            // maintenance loop has no single "job" with its own timeout —
            // it's a recurring sweep, and the interval is the only timing
            // knob that makes sense for it); `base_backoff` is the retry
            // delay after a failed sweep instead of waiting a full interval.
            maintenance_queue: queue_config_from_env(
                "MAINTENANCE_QUEUE",
                QueueConfig {
                    job_timeout: Duration::from_secs(3600),
                    base_backoff: Duration::from_secs(60),
                    ..QueueConfig::default()
                },
            )?,

            safe_mode: env::var("SAFE_MODE")
                .ok()
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            ocr_requests_per_minute: env_usize("OCR_REQUESTS_PER_MINUTE", 60)? as u32,
            extraction_requests_per_minute: env_usize("EXTRACTION_REQUESTS_PER_MINUTE", 60)? as u32,
        })
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64> {
    match env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("{key} must be a valid integer")),
        Err(_) => Ok(default),
    }
}

fn env_decimal(key: &str, default: Decimal) -> Result<Decimal> {
    match env::var(key) {
        Ok(v) => Decimal::from_str(&v).with_context(|| format!("{key} must be a valid decimal number")),
        Err(_) => Ok(default),
    }
}

/// Reads one `QueueConfig` from `{prefix}_CONCURRENCY`, `{prefix}_JOB_TIMEOUT_SECS`,
/// `{prefix}_MAX_ATTEMPTS`, `{prefix}_BASE_BACKOFF_SECS`, `{prefix}_CAP_BACKOFF_SECS`,
/// falling back to the caller-supplied `default` field by field (§6 per-queue tuning).
fn queue_config_from_env(prefix: &str, default: QueueConfig) -> Result<QueueConfig> {
    Ok(QueueConfig {
        concurrency: env_usize(&format!("{prefix}_CONCURRENCY"), default.concurrency)?,
        job_timeout: env_duration_secs(&format!("{prefix}_JOB_TIMEOUT_SECS"), default.job_timeout)?,
        max_attempts: env_usize(&format!("{prefix}_MAX_ATTEMPTS"), default.max_attempts as usize)? as i32,
        base_backoff: env_duration_secs(&format!("{prefix}_BASE_BACKOFF_SECS"), default.base_backoff)?,
        cap_backoff: env_duration_secs(&format!("{prefix}_CAP_BACKOFF_SECS"), default.cap_backoff)?,
    })
}

fn env_duration_secs(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .with_context(|| format!("{key} must be a valid number of seconds")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_selector_weights_sum_to_one() {
        SelectorWeights::default().validate().unwrap();
    }

    #[test]
    fn default_metrics_weights_sum_to_one() {
        MetricsWeights::default().validate().unwrap();
    }

    #[test]
    fn misconfigured_selector_weights_are_rejected() {
        let bad = SelectorWeights {
            w_rel: 0.5,
            w_price: 0.5,
            w_ful: 0.5,
            w_resp: 0.5,
        };
        assert!(bad.validate().is_err());
    }
}
