//! Schema definitions for spool tables.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds between two instants (fractional).
pub fn time_taken_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start)
        .num_microseconds()
        .map(|us| us as f64 / 1_000.0)
        .unwrap_or_else(|| (end - start).num_milliseconds() as f64)
}

/// One intercepted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Unique identifier (random UUIDv4).
    pub id: Uuid,

    pub path: String,

    /// JSON-encoded query string, or empty when there is none.
    pub query_params: String,

    /// Body as received, after masking and size checks.
    pub raw_body: String,

    /// Body re-encoded for display (pretty JSON for JSON and form bodies).
    pub body: String,

    pub method: String,

    pub start_time: DateTime<Utc>,

    pub end_time: Option<DateTime<Utc>>,

    /// Derived from start/end on save, in milliseconds.
    pub time_taken: Option<f64>,

    /// JSON-encoded header map, lowercased keys.
    pub encoded_headers: String,

    /// Handler name when the router supplied one.
    pub view_name: Option<String>,

    /// Must always equal the number of stored queries referencing this request.
    pub num_sql_queries: i64,

    pub num_duplicated_queries: Option<i64>,

    /// Time the profiler itself spent handling the request (ms).
    pub meta_time: Option<f64>,

    /// Number of the profiler's own bookkeeping queries.
    pub meta_num_queries: Option<i64>,

    /// Time spent in the profiler's own bookkeeping queries (ms).
    pub meta_time_spent_queries: Option<f64>,

    /// Name of the sampler blob in blob storage.
    pub prof_file: Option<String>,

    /// Text summary of the sampler report.
    pub profile_summary: String,
}

impl RequestRecord {
    /// Create a new request record starting now.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            query_params: String::new(),
            raw_body: String::new(),
            body: String::new(),
            method: method.into(),
            start_time: Utc::now(),
            end_time: None,
            time_taken: None,
            encoded_headers: String::new(),
            view_name: None,
            num_sql_queries: 0,
            num_duplicated_queries: None,
            meta_time: None,
            meta_num_queries: None,
            meta_time_spent_queries: None,
            prof_file: None,
            profile_summary: String::new(),
        }
    }

    /// Fill in `time_taken` from the start and end times.
    pub fn derive_time_taken(&mut self) {
        if let Some(end) = self.end_time {
            self.time_taken = Some(time_taken_ms(self.start_time, end));
        }
    }

    /// Meta time plus time spent on bookkeeping queries.
    pub fn total_meta_time(&self) -> f64 {
        self.meta_time.unwrap_or(0.0) + self.meta_time_spent_queries.unwrap_or(0.0)
    }
}

/// The response produced for an intercepted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: Uuid,

    /// At most one response exists per request.
    pub request_id: Uuid,

    pub status_code: u16,

    /// Base64 of the response content (empty when dropped for size).
    pub raw_body: String,

    /// Pretty-printed JSON for JSON responses, empty otherwise.
    pub body: String,

    pub encoded_headers: String,
}

/// One SQL statement execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// Temp identifier stamped by the collector on registration.
    pub identifier: Option<u64>,

    /// Owning request; `None` outside a request.
    pub request_id: Option<Uuid>,

    /// Rendered query text.
    pub query: String,

    /// Query text with literals normalized, for duplicate detection.
    pub query_structure: String,

    pub start_time: DateTime<Utc>,

    pub end_time: Option<DateTime<Utc>>,

    /// Call stack at execution, most recent frame first.
    pub traceback: String,

    /// `EXPLAIN` output when query analysis is enabled.
    pub analysis: Option<String>,
}

impl QueryRecord {
    /// Create a query record starting now.
    pub fn new(query: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            identifier: None,
            request_id: None,
            query_structure: crate::sql::query_structure(&query),
            query,
            start_time: Utc::now(),
            end_time: None,
            traceback: String::new(),
            analysis: None,
        }
    }

    /// Duration in milliseconds, once finished.
    pub fn time_taken(&self) -> Option<f64> {
        self.end_time.map(|end| time_taken_ms(self.start_time, end))
    }

    /// Rough count of joins in the query.
    pub fn num_joins(&self) -> usize {
        self.query.to_lowercase().matches("join ").count()
    }

    /// Tables named after FROM / JOIN. Subqueries are skipped.
    pub fn tables_involved(&self) -> Vec<String> {
        let components: Vec<&str> = self.query.split_whitespace().collect();
        let mut tables = Vec::new();
        for (idx, c) in components.iter().enumerate() {
            let lower = c.to_lowercase();
            if lower == "from" || lower == "join" {
                if let Some(next) = components.get(idx + 1) {
                    if !next.starts_with('(') {
                        let stripped = next.trim_matches(|c| c == ',' || c == ')' || c == ';');
                        if !stripped.is_empty() {
                            tables.push(stripped.to_string());
                        }
                    }
                }
            }
        }
        tables
    }
}

/// One profiling span, block or function form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    /// Temp identifier stamped by the collector on registration.
    pub identifier: Option<u64>,

    pub request_id: Option<Uuid>,

    pub name: String,

    pub file_path: Option<String>,

    pub line_num: Option<u32>,

    pub end_line_num: Option<u32>,

    /// Set for function profiles only.
    pub func_name: Option<String>,

    pub start_time: DateTime<Utc>,

    pub end_time: Option<DateTime<Utc>>,

    pub exception_raised: bool,

    /// True when the profile was switched on by configuration.
    pub dynamic: bool,

    /// Temp identifiers of the queries executed strictly within the span.
    pub queries: BTreeSet<u64>,
}

impl ProfileRecord {
    /// Create a profile record starting now.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            identifier: None,
            request_id: None,
            name: name.into(),
            file_path: None,
            line_num: None,
            end_line_num: None,
            func_name: None,
            start_time: Utc::now(),
            end_time: None,
            exception_raised: false,
            dynamic: false,
            queries: BTreeSet::new(),
        }
    }

    pub fn time_taken(&self) -> Option<f64> {
        self.end_time.map(|end| time_taken_ms(self.start_time, end))
    }

    pub fn is_function_profile(&self) -> bool {
        self.func_name.is_some()
    }

    pub fn is_context_profile(&self) -> bool {
        self.func_name.is_none()
    }
}

/// Tables owned by spool. Queries touching these are the profiler's own.
pub const SPOOL_TABLES: &[&str] = &[
    "spool_requests",
    "spool_responses",
    "spool_sql_queries",
    "spool_profiles",
    "spool_profile_queries",
];

/// SQL to create the spool schema.
pub const SCHEMA: &str = r#"
CREATE SEQUENCE IF NOT EXISTS spool_sql_queries_id_seq START 1;
CREATE SEQUENCE IF NOT EXISTS spool_profiles_id_seq START 1;

CREATE TABLE IF NOT EXISTS spool_requests (
    id                       VARCHAR PRIMARY KEY,
    path                     VARCHAR NOT NULL,
    query_params             VARCHAR NOT NULL DEFAULT '',
    raw_body                 VARCHAR NOT NULL DEFAULT '',
    body                     VARCHAR NOT NULL DEFAULT '',
    method                   VARCHAR NOT NULL,
    start_time               TIMESTAMP NOT NULL,
    end_time                 TIMESTAMP,
    time_taken               DOUBLE,
    encoded_headers          VARCHAR NOT NULL DEFAULT '',
    view_name                VARCHAR,
    num_sql_queries          BIGINT NOT NULL DEFAULT 0,
    num_duplicated_queries   BIGINT,
    meta_time                DOUBLE,
    meta_num_queries         BIGINT,
    meta_time_spent_queries  DOUBLE,
    prof_file                VARCHAR,
    profile_summary          VARCHAR NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS spool_responses (
    id               VARCHAR PRIMARY KEY,
    request_id       VARCHAR NOT NULL UNIQUE,
    status_code      INTEGER NOT NULL,
    raw_body         VARCHAR NOT NULL DEFAULT '',
    body             VARCHAR NOT NULL DEFAULT '',
    encoded_headers  VARCHAR NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS spool_sql_queries (
    id               BIGINT PRIMARY KEY DEFAULT nextval('spool_sql_queries_id_seq'),
    identifier       BIGINT,
    request_id       VARCHAR,
    query            VARCHAR NOT NULL,
    query_structure  VARCHAR NOT NULL DEFAULT '',
    start_time       TIMESTAMP,
    end_time         TIMESTAMP,
    time_taken       DOUBLE,
    traceback        VARCHAR NOT NULL DEFAULT '',
    analysis         VARCHAR
);

CREATE TABLE IF NOT EXISTS spool_profiles (
    id                BIGINT PRIMARY KEY DEFAULT nextval('spool_profiles_id_seq'),
    request_id        VARCHAR,
    name              VARCHAR NOT NULL DEFAULT '',
    file_path         VARCHAR NOT NULL DEFAULT '',
    line_num          INTEGER,
    end_line_num      INTEGER,
    func_name         VARCHAR,
    start_time        TIMESTAMP NOT NULL,
    end_time          TIMESTAMP,
    time_taken        DOUBLE,
    exception_raised  BOOLEAN NOT NULL DEFAULT false,
    dynamic           BOOLEAN NOT NULL DEFAULT false
);

CREATE TABLE IF NOT EXISTS spool_profile_queries (
    profile_id    BIGINT NOT NULL,
    sql_query_id  BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_spool_requests_start_time ON spool_requests(start_time);
CREATE INDEX IF NOT EXISTS idx_spool_sql_queries_request ON spool_sql_queries(request_id);
CREATE INDEX IF NOT EXISTS idx_spool_profiles_request ON spool_profiles(request_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_request_record_new() {
        let record = RequestRecord::new("GET", "/orders");
        assert_eq!(record.method, "GET");
        assert_eq!(record.path, "/orders");
        assert_eq!(record.num_sql_queries, 0);
        assert!(record.end_time.is_none());
        assert_eq!(record.id.get_version_num(), 4);
    }

    #[test]
    fn test_request_derive_time_taken() {
        let mut record = RequestRecord::new("GET", "/orders");
        record.derive_time_taken();
        assert!(record.time_taken.is_none());

        record.end_time = Some(record.start_time + Duration::milliseconds(250));
        record.derive_time_taken();
        assert_eq!(record.time_taken, Some(250.0));
    }

    #[test]
    fn test_total_meta_time() {
        let mut record = RequestRecord::new("GET", "/");
        assert_eq!(record.total_meta_time(), 0.0);
        record.meta_time = Some(1.5);
        record.meta_time_spent_queries = Some(2.0);
        assert_eq!(record.total_meta_time(), 3.5);
    }

    #[test]
    fn test_query_time_taken() {
        let mut query = QueryRecord::new("SELECT 1");
        assert!(query.time_taken().is_none());
        query.end_time = Some(query.start_time + Duration::microseconds(1_500));
        assert_eq!(query.time_taken(), Some(1.5));
    }

    #[test]
    fn test_tables_involved() {
        let query = QueryRecord::new(
            "SELECT * FROM orders JOIN customers ON orders.cid = customers.id \
             WHERE id IN (SELECT oid FROM refunds)",
        );
        assert_eq!(query.tables_involved(), vec!["orders", "customers", "refunds"]);
        assert_eq!(query.num_joins(), 1);

        let subquery = QueryRecord::new("SELECT count(*) FROM (SELECT 1) t");
        assert!(subquery.tables_involved().is_empty());
    }

    #[test]
    fn test_profile_kind() {
        let mut profile = ProfileRecord::new("checkout");
        assert!(profile.is_context_profile());
        profile.func_name = Some("checkout".to_string());
        assert!(profile.is_function_profile());
    }
}
