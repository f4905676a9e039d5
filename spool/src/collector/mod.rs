//! Request-scoped collector.
//!
//! Queries and profiles are buffered in memory while the request runs and
//! written in one transaction at the end (see [`Collector::finalize`]). Writing
//! during the request would add database round-trips to the hot path and could
//! interleave with the application's own transactions.
//!
//! Each request gets its own [`Collector`]. The handle is cheap to clone and is
//! either passed down explicitly or installed as the thread's current
//! collector with [`Collector::enter`] (see [`scope`]).

mod scope;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::profiling::sampler::{SampleReport, Sampler, SpanStack};
use crate::schema::{ProfileRecord, QueryRecord, RequestRecord, ResponseRecord};
use crate::store::{ScopeSnapshot, Store};
use crate::{Error, Result};

pub use scope::{Instrumented, ScopeGuard};

/// Bucket a buffered record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Query,
    Profile,
    /// Queries issued against spool's own tables; only used for meta profiling.
    InternalQuery,
}

impl RecordKind {
    fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Query => "queries",
            RecordKind::Profile => "profiles",
            RecordKind::InternalQuery => "internal queries",
        }
    }
}

/// A record handed to [`Collector::register`].
#[derive(Debug, Clone)]
pub enum Record {
    Query(QueryRecord),
    Profile(ProfileRecord),
    InternalQuery(QueryRecord),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Query(_) => RecordKind::Query,
            Record::Profile(_) => RecordKind::Profile,
            Record::InternalQuery(_) => RecordKind::InternalQuery,
        }
    }
}

/// Transient state of one configured scope.
struct ScopeState {
    request: Option<RequestRecord>,
    temp_identifier: u64,
    queries: BTreeMap<u64, QueryRecord>,
    profiles: BTreeMap<u64, ProfileRecord>,
    internal_queries: BTreeMap<u64, QueryRecord>,
    spans: SpanStack,
    sampler: Option<Sampler>,
    sample_report: Option<SampleReport>,
}

impl ScopeState {
    fn new(request: Option<RequestRecord>) -> Self {
        Self {
            request,
            temp_identifier: 0,
            queries: BTreeMap::new(),
            profiles: BTreeMap::new(),
            internal_queries: BTreeMap::new(),
            spans: SpanStack::default(),
            sampler: None,
            sample_report: None,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.temp_identifier += 1;
        self.temp_identifier
    }
}

/// Handle to one request's collector state.
#[derive(Clone, Default)]
pub struct Collector {
    state: Arc<Mutex<Option<ScopeState>>>,
    sampling_interval: Option<Duration>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Collector")
            .field("configured", &state.is_some())
            .field(
                "request",
                &state.as_ref().and_then(|s| s.request.as_ref().map(|r| r.id)),
            )
            .finish()
    }
}

fn not_configured(what: &str) -> Error {
    Error::NotConfigured(format!("Attempt to access {} without initialisation.", what))
}

impl Collector {
    /// Create an unconfigured collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collector that runs the statistical sampler on `configure`.
    pub fn with_sampler(interval: Duration) -> Self {
        Self {
            state: Arc::default(),
            sampling_interval: Some(interval),
        }
    }

    /// Reset all transient state and make `request` current.
    ///
    /// A sampler left running by a previous `configure` is stopped first, so
    /// calling this repeatedly never leaks sampler threads.
    pub fn configure(&self, request: Option<RequestRecord>, should_profile: bool) {
        let mut guard = self.state.lock();
        if let Some(mut previous) = guard.take() {
            if let Some(sampler) = previous.sampler.take() {
                sampler.stop();
            }
        }

        let mut state = ScopeState::new(request);
        if should_profile {
            if let Some(interval) = self.sampling_interval {
                match Sampler::start(state.spans.clone(), interval) {
                    Ok(sampler) => state.sampler = Some(sampler),
                    Err(e) => tracing::warn!(error = %e, "could not start sampling profiler"),
                }
            }
        }
        *guard = Some(state);
    }

    /// Drop all state and stop any running sampler.
    ///
    /// After `clear` the collector is unconfigured again: registering records
    /// fails until the next `configure`.
    pub fn clear(&self) {
        let mut guard = self.state.lock();
        if let Some(mut previous) = guard.take() {
            if let Some(sampler) = previous.sampler.take() {
                sampler.stop();
            }
        }
    }

    pub fn is_configured(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Allocate the next temp identifier of this scope.
    ///
    /// Identifiers start at 1 after every `configure` and increase strictly.
    pub fn next_id(&self) -> Result<u64> {
        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| not_configured("the identifier allocator"))?;
        Ok(state.next_id())
    }

    /// Stamp each record with a fresh identifier and buffer it.
    ///
    /// Returns the identifiers in registration order.
    pub fn register(&self, records: impl IntoIterator<Item = Record>) -> Result<Vec<u64>> {
        let mut guard = self.state.lock();
        let mut ids = Vec::new();
        for record in records {
            let state = guard.as_mut().ok_or_else(|| {
                Error::NotConfigured(format!(
                    "Attempt to register object of type {} without initialisation.",
                    record.kind().as_str()
                ))
            })?;
            let ident = state.next_id();
            match record {
                Record::Query(mut query) => {
                    query.identifier = Some(ident);
                    state.queries.insert(ident, query);
                }
                Record::Profile(mut profile) => {
                    profile.identifier = Some(ident);
                    state.profiles.insert(ident, profile);
                }
                Record::InternalQuery(mut query) => {
                    query.identifier = Some(ident);
                    state.internal_queries.insert(ident, query);
                }
            }
            ids.push(ident);
        }
        Ok(ids)
    }

    pub fn register_query(&self, query: QueryRecord) -> Result<u64> {
        self.register_one(Record::Query(query))
    }

    pub fn register_profile(&self, profile: ProfileRecord) -> Result<u64> {
        self.register_one(Record::Profile(profile))
    }

    pub fn register_internal_query(&self, query: QueryRecord) -> Result<u64> {
        self.register_one(Record::InternalQuery(query))
    }

    fn register_one(&self, record: Record) -> Result<u64> {
        let kind = record.kind();
        self.register([record])?
            .pop()
            .ok_or_else(|| Error::InternalInconsistency(format!("no identifier allocated for {:?}", kind)))
    }

    /// Buffered queries, keyed by temp identifier.
    pub fn queries(&self) -> Result<BTreeMap<u64, QueryRecord>> {
        self.read(RecordKind::Query, |state| state.queries.clone())
    }

    /// Buffered profiles, keyed by temp identifier.
    pub fn profiles(&self) -> Result<BTreeMap<u64, ProfileRecord>> {
        self.read(RecordKind::Profile, |state| state.profiles.clone())
    }

    /// Buffered internal queries, keyed by temp identifier.
    pub fn internal_queries(&self) -> Result<BTreeMap<u64, QueryRecord>> {
        self.read(RecordKind::InternalQuery, |state| state.internal_queries.clone())
    }

    /// Identifiers of the buffered queries, without cloning the records.
    pub fn query_ids(&self) -> Result<BTreeSet<u64>> {
        self.read(RecordKind::Query, |state| state.queries.keys().copied().collect())
    }

    fn read<T>(&self, kind: RecordKind, f: impl FnOnce(&ScopeState) -> T) -> Result<T> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or_else(|| not_configured(kind.as_str()))?;
        Ok(f(state))
    }

    /// The current request, if the scope has one.
    pub fn request(&self) -> Option<RequestRecord> {
        self.state.lock().as_ref().and_then(|s| s.request.clone())
    }

    pub fn request_id(&self) -> Option<Uuid> {
        self.state
            .lock()
            .as_ref()
            .and_then(|s| s.request.as_ref().map(|r| r.id))
    }

    /// Mutate the current request in place. Returns false when there is none.
    pub fn update_request(&self, f: impl FnOnce(&mut RequestRecord)) -> bool {
        let mut guard = self.state.lock();
        match guard.as_mut().and_then(|s| s.request.as_mut()) {
            Some(request) => {
                f(request);
                true
            }
            None => false,
        }
    }

    pub(crate) fn push_span(&self, name: &str) {
        if let Some(state) = self.state.lock().as_ref() {
            state.spans.push(name);
        }
    }

    pub(crate) fn pop_span(&self) {
        if let Some(state) = self.state.lock().as_ref() {
            state.spans.pop();
        }
    }

    /// Stop the sampler, if running, and keep its report for `finalize`.
    ///
    /// Safe to call more than once; later calls return the stored report.
    pub fn stop_sampler(&self) -> Option<SampleReport> {
        let mut guard = self.state.lock();
        let state = guard.as_mut()?;
        if let Some(sampler) = state.sampler.take() {
            state.sample_report = Some(sampler.stop());
        }
        state.sample_report.clone()
    }

    /// Copy of the buffered state, used by the persistence step.
    ///
    /// The buffers are left untouched so a failed finalize can be retried
    /// from the same data.
    pub fn snapshot(&self) -> Result<ScopeSnapshot> {
        let guard = self.state.lock();
        let state = guard
            .as_ref()
            .ok_or_else(|| not_configured("the collector state"))?;
        let request = state
            .request
            .clone()
            .ok_or_else(|| Error::Storage("Cannot finalize a scope without a request".to_string()))?;
        Ok(ScopeSnapshot {
            request,
            queries: state.queries.clone(),
            profiles: state.profiles.clone(),
        })
    }

    /// Persist everything buffered for the current request.
    ///
    /// Stops the sampler and stores its output, attaches duplicate counts and
    /// (when enabled) meta metrics to the request, then writes request,
    /// response, queries and profiles in one transaction. Returns the request
    /// as saved.
    pub fn finalize(&self, store: &Store, response: Option<&ResponseRecord>) -> Result<RequestRecord> {
        let report = self.stop_sampler();
        if let Some(report) = report {
            self.attach_sample_report(store, &report)?;
        }

        let internal = self.internal_queries()?;
        let queries = self.queries()?;
        let meta = store.config().meta;
        self.update_request(|request| {
            request.num_duplicated_queries = Some(count_duplicates(queries.values()));
            if meta {
                request.meta_num_queries = Some(internal.len() as i64);
                request.meta_time_spent_queries =
                    Some(internal.values().filter_map(QueryRecord::time_taken).sum());
            }
            if request.end_time.is_none() {
                request.end_time = Some(Utc::now());
            }
            request.derive_time_taken();
        });

        let snapshot = self.snapshot()?;
        let saved = store.save_scope(&snapshot, response)?;
        self.update_request(|request| request.num_sql_queries = saved.num_sql_queries);
        Ok(saved)
    }

    fn attach_sample_report(&self, store: &Store, report: &SampleReport) -> Result<()> {
        let config = store.config();
        let summary = report.summary(config.profile_summary_lines);
        let needs_blob = config.sampling_profiler_binary
            && self.request().map_or(false, |r| r.prof_file.is_none());

        let blob_name = if needs_blob {
            let request = self
                .request()
                .ok_or_else(|| Error::Storage("No request to attach profile to".to_string()))?;
            let name = store
                .blobs()
                .get_available_name(&crate::storage::profile_blob_name(&request.path, &request.id));
            let content = serde_json::to_vec(report)?;
            Some(store.blobs().save(&name, &content)?)
        } else {
            None
        };

        self.update_request(|request| {
            request.profile_summary = summary;
            if blob_name.is_some() {
                request.prof_file = blob_name;
            }
        });
        Ok(())
    }
}

/// Number of queries whose structure already appeared earlier in the request.
fn count_duplicates<'a>(queries: impl Iterator<Item = &'a QueryRecord>) -> i64 {
    let mut seen: HashMap<&str, i64> = HashMap::new();
    for query in queries {
        *seen.entry(query.query_structure.as_str()).or_insert(0) += 1;
    }
    seen.values().map(|n| n - 1).sum()
}
