use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::StoreError;
use crate::endpoints::{
    DeleteOutcome, Endpoint, EndpointStore, NewEndpoint, ReclaimedLease, UpsertOutcome,
};
use crate::events::{DecodedEvent, EventStore, MissingSignature, UNKNOWN_EVENT};
use crate::metrics::{GlobalStats, NewRun, ProcessingRun, RunCompletion, RunFailure, RunStatus, RunStore};
use crate::signatures::{CacheEntry, CacheStats, NewCacheEntry, SignatureStore};

#[derive(Debug, Default)]
struct State {
    endpoints: BTreeMap<i64, Endpoint>,
    next_endpoint_id: i64,
    runs: BTreeMap<i64, ProcessingRun>,
    next_run_id: i64,
    events: Vec<DecodedEvent>,
    signatures: HashMap<String, CacheEntry>,

    leases_granted: u64,
    leases_released: u64,
    signature_writes: u64,

    fail_at_event: Option<usize>,
    failing_batches: u32,
    fail_signature_reads: bool,
}

/// Single-process implementation of every store trait.
///
/// Each operation runs under one mutex, which gives the same atomicity the
/// conditional SQL statements give the PostgreSQL stores. Failure injection
/// hooks let tests exercise rollback and retry paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn with<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        match self.state.lock() {
            Ok(state) => f(&state),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn with_mut(&self, f: impl FnOnce(&mut State)) {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Number of successful `try_lease` calls.
    pub fn leases_granted(&self) -> u64 {
        self.with(|s| s.leases_granted)
    }

    /// Number of `release` calls that cleared a held lease.
    pub fn leases_released(&self) -> u64 {
        self.with(|s| s.leases_released)
    }

    pub fn signature_writes(&self) -> u64 {
        self.with(|s| s.signature_writes)
    }

    /// Fails the next batch insert while staging its `n`th event (1-based).
    pub fn fail_batch_at_event(&self, n: usize) {
        self.with_mut(|s| s.fail_at_event = Some(n));
    }

    /// Fails the next `count` batch inserts outright.
    pub fn fail_next_batches(&self, count: u32) {
        self.with_mut(|s| s.failing_batches = count);
    }

    pub fn fail_signature_reads(&self, fail: bool) {
        self.with_mut(|s| s.fail_signature_reads = fail);
    }

    pub fn events(&self) -> Vec<DecodedEvent> {
        self.with(|s| s.events.clone())
    }

    pub fn runs(&self) -> Vec<ProcessingRun> {
        self.with(|s| s.runs.values().cloned().collect())
    }
}

fn clear_lease(endpoint: &mut Endpoint) {
    endpoint.in_use = false;
    endpoint.lease_holder = None;
    endpoint.leased_at = None;
}

#[async_trait]
impl EndpointStore for MemoryStore {
    async fn eligible(&self) -> Result<Vec<Endpoint>, StoreError> {
        let state = self.lock()?;
        Ok(state.endpoints.values().filter(|e| e.is_eligible()).cloned().collect())
    }

    async fn try_lease(&self, id: i64, holder: &str) -> Result<Option<Endpoint>, StoreError> {
        let mut state = self.lock()?;
        let leased = match state.endpoints.get_mut(&id) {
            Some(endpoint) if endpoint.is_eligible() => {
                endpoint.in_use = true;
                endpoint.lease_holder = Some(holder.to_string());
                endpoint.leased_at = Some(Utc::now());
                Some(endpoint.clone())
            }
            _ => None,
        };
        if leased.is_some() {
            state.leases_granted += 1;
        }
        Ok(leased)
    }

    async fn release(&self, id: i64) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let was_held = match state.endpoints.get_mut(&id) {
            Some(endpoint) if endpoint.in_use => {
                clear_lease(endpoint);
                true
            }
            _ => false,
        };
        if was_held {
            state.leases_released += 1;
        }
        Ok(was_held)
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        Ok(match state.endpoints.get_mut(&id) {
            Some(endpoint) => {
                endpoint.active = active;
                true
            }
            None => false,
        })
    }

    async fn count_active(&self) -> Result<u64, StoreError> {
        let state = self.lock()?;
        Ok(state.endpoints.values().filter(|e| e.active).count() as u64)
    }

    async fn list(&self) -> Result<Vec<Endpoint>, StoreError> {
        let state = self.lock()?;
        Ok(state.endpoints.values().cloned().collect())
    }

    async fn get(&self, id: i64) -> Result<Option<Endpoint>, StoreError> {
        let state = self.lock()?;
        Ok(state.endpoints.get(&id).cloned())
    }

    async fn upsert(&self, new: &NewEndpoint) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.lock()?;
        if let Some(existing) = state.endpoints.values_mut().find(|e| e.url == new.url) {
            existing.name = new.name.clone();
            existing.active = new.active;
            if new.last_known_block.is_some() {
                existing.last_known_block = new.last_known_block;
            }
            existing.last_error = new.last_error.clone();
            return Ok(UpsertOutcome::Updated);
        }
        state.next_endpoint_id += 1;
        let id = state.next_endpoint_id;
        state.endpoints.insert(
            id,
            Endpoint {
                id,
                name: new.name.clone(),
                url: new.url.clone(),
                active: new.active,
                in_use: false,
                lease_holder: None,
                leased_at: None,
                last_known_block: new.last_known_block,
                last_health_check_at: None,
                last_error: new.last_error.clone(),
            },
        );
        Ok(UpsertOutcome::Inserted)
    }

    async fn delete_if_free(&self, id: i64) -> Result<DeleteOutcome, StoreError> {
        let mut state = self.lock()?;
        Ok(match state.endpoints.get(&id) {
            None => DeleteOutcome::NotFound,
            Some(endpoint) if endpoint.in_use => DeleteOutcome::Leased,
            Some(_) => {
                state.endpoints.remove(&id);
                DeleteOutcome::Deleted
            }
        })
    }

    async fn release_all(&self) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut released = 0;
        for endpoint in state.endpoints.values_mut().filter(|e| e.in_use) {
            clear_lease(endpoint);
            released += 1;
        }
        Ok(released)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ReclaimedLease>, StoreError> {
        let mut state = self.lock()?;
        let mut reclaimed = Vec::new();
        for endpoint in state.endpoints.values_mut() {
            let stale = endpoint.in_use && endpoint.leased_at.is_some_and(|at| at <= cutoff);
            if stale {
                reclaimed.push(ReclaimedLease {
                    endpoint_id: endpoint.id,
                    holder: endpoint.lease_holder.clone(),
                    leased_at: endpoint.leased_at,
                });
                clear_lease(endpoint);
            }
        }
        Ok(reclaimed)
    }

    async fn record_health(
        &self,
        id: i64,
        last_known_block: Option<u64>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if let Some(endpoint) = state.endpoints.get_mut(&id) {
            if last_known_block.is_some() {
                endpoint.last_known_block = last_known_block;
            }
            endpoint.last_error = error.map(str::to_string);
            endpoint.last_health_check_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn open_run(&self, run: &NewRun) -> Result<i64, StoreError> {
        let mut state = self.lock()?;
        state.next_run_id += 1;
        let id = state.next_run_id;
        state.runs.insert(
            id,
            ProcessingRun {
                id,
                consumer_id: run.consumer_id.clone(),
                endpoint_id: Some(run.endpoint_id),
                endpoint_url: Some(run.endpoint_url.clone()),
                status: RunStatus::Processing,
                blocks_processed: 0,
                events_extracted: 0,
                errors_count: 0,
                retry_count: run.retry_count,
                start_block: run.start_block,
                end_block: run.end_block,
                execution_time_ms: None,
                blocks_per_second: None,
                started_at: Utc::now(),
                finished_at: None,
                error_message: None,
                stack_trace: None,
            },
        );
        Ok(id)
    }

    async fn complete_run(&self, id: i64, completion: &RunCompletion) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        Ok(match state.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Processing => {
                run.status = RunStatus::Completed;
                run.blocks_processed = completion.blocks_processed;
                run.events_extracted = completion.events_extracted;
                run.execution_time_ms = Some(completion.execution_time_ms);
                run.blocks_per_second = Some(completion.blocks_per_second);
                run.finished_at = Some(Utc::now());
                true
            }
            _ => false,
        })
    }

    async fn fail_run(&self, id: i64, failure: &RunFailure) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        Ok(match state.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Processing => {
                run.status = RunStatus::Failed;
                run.error_message = Some(failure.error_message.clone());
                run.stack_trace = failure.stack_trace.clone();
                run.execution_time_ms = Some(failure.execution_time_ms);
                run.errors_count += failure.errors_count;
                run.finished_at = Some(Utc::now());
                true
            }
            _ => false,
        })
    }

    async fn fail_open_runs(
        &self,
        endpoint_id: i64,
        consumer_id: Option<&str>,
        message: &str,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut failed = 0;
        for run in state.runs.values_mut() {
            let matches = run.status == RunStatus::Processing
                && run.endpoint_id == Some(endpoint_id)
                && consumer_id.is_none_or(|c| run.consumer_id == c);
            if matches {
                run.status = RunStatus::Failed;
                run.error_message = Some(message.to_string());
                run.errors_count += 1;
                run.finished_at = Some(Utc::now());
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn get_run(&self, id: i64) -> Result<Option<ProcessingRun>, StoreError> {
        let state = self.lock()?;
        Ok(state.runs.get(&id).cloned())
    }

    async fn runs_for_range(&self, start_block: u64, end_block: u64) -> Result<Vec<ProcessingRun>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .runs
            .values()
            .filter(|r| r.start_block == start_block && r.end_block == end_block)
            .cloned()
            .collect())
    }

    async fn active_runs(&self) -> Result<Vec<ProcessingRun>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Processing)
            .cloned()
            .collect())
    }

    async fn global_stats(&self) -> Result<GlobalStats, StoreError> {
        let state = self.lock()?;
        let mut stats = GlobalStats::default();
        let mut total_ms = 0u64;
        for run in state.runs.values() {
            match run.status {
                RunStatus::Completed => {
                    stats.completed += 1;
                    stats.total_blocks += run.blocks_processed;
                    stats.total_events += run.events_extracted;
                    total_ms += run.execution_time_ms.unwrap_or_default();
                }
                RunStatus::Failed => stats.failed += 1,
                RunStatus::Processing => stats.processing += 1,
                RunStatus::Retrying => {}
            }
        }
        if stats.completed > 0 {
            stats.avg_execution_time_ms = Some(total_ms as f64 / stats.completed as f64);
        }
        Ok(stats)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_batch(&self, events: &[DecodedEvent]) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        if state.failing_batches > 0 {
            state.failing_batches -= 1;
            return Err(StoreError::Rejected("injected batch failure".to_string()));
        }
        let fail_at = state.fail_at_event.take();

        let mut staged = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            if fail_at == Some(i + 1) {
                return Err(StoreError::Rejected(format!(
                    "injected failure on event {} of {}",
                    i + 1,
                    events.len()
                )));
            }
            staged.push(event.clone());
        }
        state.events.extend(staged);
        Ok(events.len() as u64)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let state = self.lock()?;
        Ok(state.events.len() as u64)
    }

    async fn backfill_event_names(&self) -> Result<u64, StoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let mut updated = 0;
        for event in state.events.iter_mut() {
            let needs_name = event
                .event_name
                .as_deref()
                .is_none_or(|name| name == UNKNOWN_EVENT);
            if !needs_name {
                continue;
            }
            if let Some(entry) = state.signatures.get(&event.event_signature) {
                if entry.event_name != UNKNOWN_EVENT {
                    event.event_name = Some(entry.event_name.clone());
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn missing_signatures(&self, limit: usize) -> Result<Vec<MissingSignature>, StoreError> {
        let state = self.lock()?;
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for event in &state.events {
            let signature = event.event_signature.as_str();
            if !signature.is_empty() && !state.signatures.contains_key(signature) {
                *counts.entry(signature).or_default() += 1;
            }
        }
        let mut missing: Vec<MissingSignature> = counts
            .into_iter()
            .map(|(signature, occurrences)| MissingSignature {
                signature: signature.to_string(),
                occurrences,
            })
            .collect();
        missing.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        missing.truncate(limit);
        Ok(missing)
    }
}

#[async_trait]
impl SignatureStore for MemoryStore {
    async fn get_and_touch(&self, signature: &str) -> Result<Option<CacheEntry>, StoreError> {
        let mut state = self.lock()?;
        if state.fail_signature_reads {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(state.signatures.get_mut(signature).map(|entry| {
            entry.hit_count += 1;
            entry.last_used_at = Utc::now();
            entry.clone()
        }))
    }

    async fn insert(&self, new: &NewCacheEntry) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.signature_writes += 1;
        if !state.signatures.contains_key(&new.signature) {
            let now = Utc::now();
            state.signatures.insert(
                new.signature.clone(),
                CacheEntry {
                    signature: new.signature.clone(),
                    event_name: new.event_name.clone(),
                    text_signature: new.text_signature.clone(),
                    source: new.source.clone(),
                    hit_count: 0,
                    first_seen_at: now,
                    last_used_at: now,
                },
            );
        }
        Ok(())
    }

    async fn cleanup(&self, older_than: DateTime<Utc>, min_hit_count: u64) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let before = state.signatures.len();
        state
            .signatures
            .retain(|_, e| !(e.last_used_at < older_than && e.hit_count < min_hit_count));
        Ok((before - state.signatures.len()) as u64)
    }

    async fn export_all(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let state = self.lock()?;
        let mut entries: Vec<CacheEntry> = state.signatures.values().cloned().collect();
        entries.sort_by(|a, b| a.signature.cmp(&b.signature));
        Ok(entries)
    }

    async fn stats(&self, top: usize) -> Result<CacheStats, StoreError> {
        let state = self.lock()?;
        let mut by_source: BTreeMap<String, u64> = BTreeMap::new();
        let mut stats = CacheStats::default();
        for entry in state.signatures.values() {
            stats.total += 1;
            if entry.event_name == UNKNOWN_EVENT {
                stats.unknown += 1;
            }
            *by_source.entry(entry.source.clone()).or_default() += 1;
        }
        stats.by_source = by_source.into_iter().collect();

        let mut entries: Vec<CacheEntry> = state.signatures.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.hit_count
                .cmp(&a.hit_count)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        stats.most_used = entries.iter().take(top).cloned().collect();
        entries.sort_by(|a, b| {
            a.last_used_at
                .cmp(&b.last_used_at)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        stats.least_recently_used = entries.into_iter().take(top).collect();
        Ok(stats)
    }

    async fn truncate(&self) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let n = state.signatures.len() as u64;
        state.signatures.clear();
        Ok(n)
    }
}
