//! spool: request-scoped SQL and code profiling
//!
//! Records the SQL queries and profiled code spans executed while serving a
//! request, buffers them in memory, and persists them to DuckDB in one
//! transaction when the response is produced.

pub mod capture;
pub mod collector;
pub mod config;
pub mod error;
pub mod init;
pub mod masking;
pub mod middleware;
pub mod profiling;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod store;

pub use capture::{Capture, ViewName};
pub use collector::{Collector, Instrumented, Record, RecordKind, ScopeGuard};
pub use config::{Config, DynamicProfile};
pub use error::{Error, Result};
pub use init::{initialize, is_initialized};
pub use masking::{Masker, CLEANSED_SUBSTITUTE};
pub use middleware::{ProfilingMiddleware, ProfilingMiddlewareBuilder, RequestContext, RequestHead};
pub use profiling::dynamic::DynamicProfiler;
pub use profiling::sampler::SampleReport;
pub use profiling::{profile, profile_block, ActiveSpan, Profiled, Span};
pub use schema::{ProfileRecord, QueryRecord, RequestRecord, ResponseRecord};
pub use sql::{QueryInterceptor, Traced, TracedConnection};
pub use storage::{BlobStorage, FileSystemStorage, MemoryStorage};
pub use store::{GcStats, ScopeSnapshot, Store, StoredProfile, StoredQuery};
