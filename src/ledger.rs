//! Completion receipts on an external append-only ledger.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::util::trim_base_url;

/// Proof that a completion hash was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    /// Transaction or entry reference
    pub reference: String,
    /// Block / sequence number the entry landed in
    pub sequence: u64,
    pub lookup_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Ledger request failed: {0}")]
    Transport(String),

    #[error("Ledger returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid ledger response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn record(
        &self,
        task_id: Uuid,
        verification_hash: &str,
        checkpoint_count: usize,
    ) -> Result<LedgerReceipt, LedgerError>;
}

#[derive(Debug, Serialize)]
struct RecordRequest<'a> {
    task_id: Uuid,
    verification_hash: &'a str,
    checkpoint_count: usize,
}

/// Ledger reached over HTTP at `{base_url}/receipts`.
#[derive(Clone)]
pub struct HttpLedger {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpLedger {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: trim_base_url(base_url),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn record(
        &self,
        task_id: Uuid,
        verification_hash: &str,
        checkpoint_count: usize,
    ) -> Result<LedgerReceipt, LedgerError> {
        let mut builder = self
            .client
            .post(format!("{}/receipts", self.base_url))
            .json(&RecordRequest {
                task_id,
                verification_hash,
                checkpoint_count,
            });
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LedgerError::Api {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| LedgerError::InvalidResponse(e.to_string()))
    }
}

#[derive(Debug, Clone)]
struct LocalEntry {
    task_id: Uuid,
    verification_hash: String,
}

/// In-process append-only ledger, used when no external ledger is configured.
#[derive(Default)]
pub struct LocalLedger {
    entries: Mutex<Vec<LocalEntry>>,
}

impl LocalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hash recorded for a task, if any.
    pub fn hash_for(&self, task_id: Uuid) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries
            .iter()
            .find(|e| e.task_id == task_id)
            .map(|e| e.verification_hash.clone())
    }
}

#[async_trait]
impl Ledger for LocalLedger {
    async fn record(
        &self,
        task_id: Uuid,
        verification_hash: &str,
        checkpoint_count: usize,
    ) -> Result<LedgerReceipt, LedgerError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| LedgerError::Transport("local ledger lock poisoned".to_string()))?;
        entries.push(LocalEntry {
            task_id,
            verification_hash: verification_hash.to_string(),
        });
        let sequence = entries.len() as u64;

        let mut hasher = Sha256::new();
        hasher.update(format!("{sequence}:{task_id}:{verification_hash}:{checkpoint_count}"));
        let reference = hex::encode(hasher.finalize());

        Ok(LedgerReceipt {
            reference,
            sequence,
            lookup_url: format!("local://receipts/{}", sequence),
        })
    }
}
