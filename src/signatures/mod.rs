//! Topic-hash to event-name resolution.
//!
//! Lookups go memory, then the persistent `signature_cache` table, then the
//! remote service. Remote misses are remembered as `Unknown` in both tiers so a
//! signature is sent to the remote service at most once per cache lifetime.

mod lookup;
mod store;

pub use lookup::{normalize_signature, FourByteClient, LookupError, SignatureLookup, FOURBYTE_SOURCE};
pub use store::{CacheEntry, CacheStats, NewCacheEntry, PgSignatureStore, SignatureStore};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;

use crate::events::UNKNOWN_EVENT;
use crate::store::StoreError;

const RESOLVE_BATCH_SIZE: usize = 5;
const RESOLVE_BATCH_PAUSE: Duration = Duration::from_millis(100);

/// Event name from a canonical signature: `Transfer(address,...)` -> `Transfer`.
pub fn event_name_from_text(text_signature: &str) -> &str {
    match text_signature.find('(') {
        Some(idx) => &text_signature[..idx],
        None => text_signature,
    }
}

pub struct SignatureCache {
    memory: RwLock<HashMap<String, String>>,
    store: Arc<dyn SignatureStore>,
    remote: Arc<dyn SignatureLookup>,
    max_attempts: u32,
    rate_limit_base: Duration,
}

impl SignatureCache {
    pub fn new(store: Arc<dyn SignatureStore>, remote: Arc<dyn SignatureLookup>) -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            store,
            remote,
            max_attempts: 3,
            rate_limit_base: Duration::from_secs(1),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Resolves `signature` to an event name. `None` means the remote service
    /// does not know it (or never answered).
    pub async fn resolve(&self, signature: &str) -> Option<String> {
        if signature.is_empty() {
            return None;
        }
        let name = match self.memory_get(signature) {
            Some(name) => name,
            None => match self.persistent_get(signature).await {
                Some(name) => name,
                None => self.resolve_remote(signature).await,
            },
        };
        if name == UNKNOWN_EVENT {
            None
        } else {
            Some(name)
        }
    }

    /// Resolves distinct signatures in small concurrent groups, pausing between
    /// groups to stay under the remote service's rate limit.
    pub async fn resolve_many(&self, signatures: &[String]) -> HashMap<String, Option<String>> {
        let mut seen = HashSet::new();
        let distinct: Vec<&String> = signatures.iter().filter(|s| seen.insert(s.as_str())).collect();

        let mut resolved = HashMap::with_capacity(distinct.len());
        for (i, group) in distinct.chunks(RESOLVE_BATCH_SIZE).enumerate() {
            if i > 0 {
                tokio::time::sleep(RESOLVE_BATCH_PAUSE).await;
            }
            let names = join_all(group.iter().map(|sig| self.resolve(sig))).await;
            for (sig, name) in group.iter().zip(names) {
                resolved.insert((*sig).clone(), name);
            }
        }
        resolved
    }

    fn memory_get(&self, signature: &str) -> Option<String> {
        match self.memory.read() {
            Ok(map) => map.get(signature).cloned(),
            Err(poisoned) => poisoned.into_inner().get(signature).cloned(),
        }
    }

    fn memory_put(&self, signature: &str, name: &str) {
        match self.memory.write() {
            Ok(mut map) => {
                map.insert(signature.to_string(), name.to_string());
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(signature.to_string(), name.to_string());
            }
        }
    }

    async fn persistent_get(&self, signature: &str) -> Option<String> {
        match self.store.get_and_touch(signature).await {
            Ok(Some(entry)) => {
                self.memory_put(signature, &entry.event_name);
                Some(entry.event_name)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Signature cache read failed for {}, treating as miss: {}", signature, e);
                None
            }
        }
    }

    async fn resolve_remote(&self, signature: &str) -> String {
        let mut attempt = 0;
        let text_signature = loop {
            attempt += 1;
            match self.remote.lookup(signature).await {
                Ok(text) => break Some(text),
                Err(LookupError::NotFound) => {
                    tracing::debug!("Signature {} not found remotely", signature);
                    break None;
                }
                Err(e) if attempt >= self.max_attempts => {
                    tracing::warn!(
                        "Giving up on signature {} after {} attempts: {}",
                        signature,
                        attempt,
                        e
                    );
                    break None;
                }
                Err(LookupError::RateLimited) => {
                    let delay = self.rate_limit_base * 2u32.saturating_pow(attempt);
                    tracing::warn!(
                        "Signature service rate limited (attempt {}/{}), backing off {:?}",
                        attempt,
                        self.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        "Signature lookup for {} failed (attempt {}/{}): {}",
                        signature,
                        attempt,
                        self.max_attempts,
                        e
                    );
                }
            }
        };

        let name = match &text_signature {
            Some(text) => event_name_from_text(text).to_string(),
            None => UNKNOWN_EVENT.to_string(),
        };
        self.memory_put(signature, &name);
        self.persist_detached(NewCacheEntry {
            signature: signature.to_string(),
            event_name: name.clone(),
            text_signature,
            source: self.remote.source().to_string(),
        });
        name
    }

    /// Writes the entry in the background; the caller never waits on or fails
    /// because of the persistent tier.
    fn persist_detached(&self, entry: NewCacheEntry) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.insert(&entry).await {
                tracing::warn!("Failed to persist signature {}: {}", entry.signature, e);
            }
        });
    }

    pub fn memory_len(&self) -> usize {
        match self.memory.read() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn clear_memory(&self) {
        match self.memory.write() {
            Ok(mut map) => map.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        tracing::info!("In-process signature cache cleared");
    }

    pub async fn stats(&self, top: usize) -> Result<CacheStats, StoreError> {
        self.store.stats(top).await
    }

    /// Deletes persistent entries unused for `older_than` with fewer than
    /// `min_hit_count` hits. The memory tier is dropped as well so removed
    /// entries are not served from it.
    pub async fn cleanup(&self, older_than: Duration, min_hit_count: u64) -> Result<u64, StoreError> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| StoreError::Rejected(format!("cleanup age out of range: {}", e)))?;
        let deleted = self.store.cleanup(Utc::now() - age, min_hit_count).await?;
        self.clear_memory();
        tracing::info!("Signature cache cleanup removed {} entries", deleted);
        Ok(deleted)
    }

    pub async fn export_all(&self) -> Result<Vec<CacheEntry>, StoreError> {
        self.store.export_all().await
    }

    pub async fn truncate(&self) -> Result<u64, StoreError> {
        let removed = self.store.truncate().await?;
        self.clear_memory();
        Ok(removed)
    }
}

impl std::fmt::Debug for SignatureCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureCache")
            .field("memory_entries", &self.memory_len())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
