//! Outbound collaborator contracts (§6 "Outbound from the core").
//!
//! One narrow trait per external capability: no concrete HTTP client is
//! baked into the core, and each trait carries its own associated `Error`
//! type so a provider's failure modes don't leak into unrelated
//! collaborators.

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

/// `blob_store.get(blob_ref) -> bytes | NotFound` (§6).
#[async_trait]
pub trait BlobStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get(&self, blob_ref: &str) -> Result<Vec<u8>, BlobError<Self::Error>>;
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError<E: std::error::Error + Send + Sync + 'static> {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Provider(E),
}

/// Per-line OCR confidence, paired with the recognized text.
#[derive(Debug, Clone)]
pub struct OcrOutput {
    pub text: String,
    pub per_line_confidences: Vec<f64>,
}

/// `ocr.extract_text(bytes) -> {text, per_line_confidences} | ErrorKind` (§6).
#[async_trait]
pub trait OcrProvider: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn extract_text(&self, bytes: &[u8]) -> Result<OcrOutput, OcrError<Self::Error>>;
}

#[derive(Debug, thiserror::Error)]
pub enum OcrError<E: std::error::Error + Send + Sync + 'static> {
    #[error("image unreadable")]
    UnreadableImage,
    #[error("provider unavailable")]
    ProviderUnavailable,
    #[error(transparent)]
    Provider(E),
}

/// One loosely-typed record as extracted before cleaning (§4.B "Extraction
/// contract"). Fields are deliberately permissive — the cleaning pass in
/// [`crate::ingestion::cleaning`] is what enforces the contract.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct RawExtractedRecord {
    pub name: Option<String>,
    pub quantity: Option<serde_json::Value>,
    pub unit: Option<String>,
    pub confidence: Option<f64>,
}

/// `extractor.extract_items(text) -> [{name, quantity, unit, confidence}] | ErrorKind` (§6).
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn extract_items(
        &self,
        text: &str,
    ) -> Result<Vec<RawExtractedRecord>, ExtractionError<Self::Error>>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError<E: std::error::Error + Send + Sync + 'static> {
    #[error("malformed structured output")]
    MalformedStructuredOutput,
    #[error("provider unavailable")]
    ProviderUnavailable,
    #[error(transparent)]
    Provider(E),
}

/// `notifier.send(target, payload) -> Ack | ErrorKind` (§6). Called
/// exclusively by the outbox relay, never directly by a stage handler.
#[async_trait]
pub trait Notifier: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn send(&self, target: &str, payload: &serde_json::Value) -> Result<(), Self::Error>;
}

/// `credit.check_and_reserve(retailer_id, amount) -> Ok | Rejected{reason}` (§6).
#[async_trait]
pub trait CreditGate: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn check_and_reserve(
        &self,
        retailer_id: Uuid,
        amount: Decimal,
    ) -> Result<CreditDecision, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditDecision {
    Ok,
    Rejected { reason: String },
}

#[cfg(any(test, feature = "testing"))]
pub mod fakes {
    use super::*;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::sync::Mutex;

    /// In-memory [`BlobStore`] fake, keyed by `blob_ref`.
    #[derive(Default)]
    pub struct FakeBlobStore {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl FakeBlobStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put(&self, blob_ref: impl Into<String>, bytes: impl Into<Vec<u8>>) {
            self.blobs.lock().unwrap().insert(blob_ref.into(), bytes.into());
        }
    }

    #[async_trait]
    impl BlobStore for FakeBlobStore {
        type Error = Infallible;

        async fn get(&self, blob_ref: &str) -> Result<Vec<u8>, BlobError<Self::Error>> {
            self.blobs
                .lock()
                .unwrap()
                .get(blob_ref)
                .cloned()
                .ok_or_else(|| BlobError::NotFound(blob_ref.to_string()))
        }
    }

    /// Scripted [`OcrProvider`] fake: returns queued outcomes in order, then
    /// repeats the last one. Used to simulate transient outages (§8 scenario 4).
    pub struct ScriptedOcr {
        script: Mutex<Vec<Result<OcrOutput, OcrScriptedError>>>,
    }

    #[derive(Debug, Clone)]
    pub enum OcrScriptedError {
        Unreadable,
        Unavailable,
    }

    impl ScriptedOcr {
        pub fn new(script: Vec<Result<OcrOutput, OcrScriptedError>>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }

        pub fn always(output: OcrOutput) -> Self {
            Self::new(vec![Ok(output)])
        }
    }

    #[async_trait]
    impl OcrProvider for ScriptedOcr {
        type Error = Infallible;

        async fn extract_text(&self, _bytes: &[u8]) -> Result<OcrOutput, OcrError<Self::Error>> {
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            };
            next.map_err(|e| match e {
                OcrScriptedError::Unreadable => OcrError::UnreadableImage,
                OcrScriptedError::Unavailable => OcrError::ProviderUnavailable,
            })
        }
    }

    /// Scripted [`ExtractionProvider`] fake, same replay semantics as [`ScriptedOcr`].
    pub struct ScriptedExtractor {
        script: Mutex<Vec<Result<Vec<RawExtractedRecord>, ()>>>,
    }

    impl ScriptedExtractor {
        pub fn new(script: Vec<Result<Vec<RawExtractedRecord>, ()>>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }

        pub fn always(records: Vec<RawExtractedRecord>) -> Self {
            Self::new(vec![Ok(records)])
        }

        pub fn always_malformed() -> Self {
            Self::new(vec![Err(())])
        }
    }

    #[async_trait]
    impl ExtractionProvider for ScriptedExtractor {
        type Error = Infallible;

        async fn extract_items(
            &self,
            _text: &str,
        ) -> Result<Vec<RawExtractedRecord>, ExtractionError<Self::Error>> {
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            };
            next.map_err(|_| ExtractionError::MalformedStructuredOutput)
        }
    }

    /// Records every `send` call; never fails.
    #[derive(Default)]
    pub struct FakeNotifier {
        pub sent: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl FakeNotifier {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        type Error = Infallible;

        async fn send(&self, target: &str, payload: &serde_json::Value) -> Result<(), Self::Error> {
            self.sent
                .lock()
                .unwrap()
                .push((target.to_string(), payload.clone()));
            Ok(())
        }
    }

    /// Always approves; tests that care about rejection construct their own.
    pub struct FakeCreditGate;

    #[async_trait]
    impl CreditGate for FakeCreditGate {
        type Error = Infallible;

        async fn check_and_reserve(
            &self,
            _retailer_id: Uuid,
            _amount: Decimal,
        ) -> Result<CreditDecision, Self::Error> {
            Ok(CreditDecision::Ok)
        }
    }
}
