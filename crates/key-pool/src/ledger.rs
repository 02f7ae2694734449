//! Persisted key exhaustion
//!
//! Records which keys ran out of quota and until when, so a restarted worker
//! does not burn a round of calls rediscovering exhausted keys. Keys are
//! stored by fingerprint, never by value. Writes use temp-file + rename so a
//! crash mid-write leaves the previous ledger intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Fingerprint → end of exhaustion, backed by a JSON file.
pub struct ExhaustionLedger {
    path: PathBuf,
    state: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ExhaustionLedger {
    /// Load the ledger from `path`. A missing file is an empty ledger.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Ledger(format!("reading ledger file: {e}")))?;
            let entries: HashMap<String, DateTime<Utc>> = serde_json::from_str(&contents)
                .map_err(|e| Error::Ledger(format!("parsing ledger file: {e}")))?;
            info!(path = %path.display(), entries = entries.len(), "loaded exhaustion ledger");
            entries
        } else {
            debug!(path = %path.display(), "no exhaustion ledger yet");
            HashMap::new()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Entries whose exhaustion window has not yet ended at `now`.
    pub async fn active(&self, now: DateTime<Utc>) -> HashMap<String, DateTime<Utc>> {
        let state = self.state.lock().await;
        state
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(fingerprint, until)| (fingerprint.clone(), *until))
            .collect()
    }

    /// Record a key as exhausted until `until` and persist.
    ///
    /// Entries that have already expired are pruned on every write.
    pub async fn record(&self, fingerprint: &str, until: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.retain(|_, expiry| *expiry > now);
        state.insert(fingerprint.to_string(), until);
        write_atomic(&self.path, &state).await
    }

    /// Forget every entry and persist the empty ledger.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_empty() {
            return Ok(());
        }
        state.clear();
        write_atomic(&self.path, &state).await
    }
}

async fn write_atomic(path: &Path, data: &HashMap<String, DateTime<Utc>>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Ledger(format!("serializing ledger: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Ledger("ledger path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".key-ledger.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Ledger(format!("writing temp ledger file: {e}")))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Ledger(format!("renaming temp ledger file: {e}")))?;

    debug!(path = %path.display(), entries = data.len(), "persisted exhaustion ledger");
    Ok(())
}
