//! SQL interception.
//!
//! [`QueryInterceptor`] wraps the single point where a statement is handed to
//! the driver: it renders the statement with its parameters, times the real
//! execution and registers a [`QueryRecord`] with the thread's current
//! [`Collector`]. The driver's result is returned untouched.
//!
//! [`TracedConnection`] applies the interceptor to a DuckDB connection.
//! spool's own store talks to DuckDB through a plain connection, so its
//! persistence queries never loop back through here.

use std::backtrace::{Backtrace, BacktraceStatus};

use chrono::Utc;
use duckdb::types::Value;
use duckdb::{params_from_iter, Connection, Row};

use crate::collector::Collector;
use crate::schema::{QueryRecord, SPOOL_TABLES};
use crate::{Config, Error, Result};

/// Statement prefixes that are never recorded.
const SKIPPED_PREFIXES: &[&str] = &[
    "SAVEPOINT",
    "RELEASE SAVEPOINT",
    "ROLLBACK TO SAVEPOINT",
    "PRAGMA",
    "EXPLAIN",
];

/// Normalize a statement for duplicate detection.
///
/// String and numeric literals become `?` and whitespace runs collapse, so
/// `WHERE id = 1` and `WHERE id  = 2` share a structure.
pub fn query_structure(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut prev: Option<char> = None;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                // Quoted literal; '' is an escaped quote.
                while let Some(n) = chars.next() {
                    if n == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
                out.push('?');
                prev = Some('?');
            }
            c if c.is_ascii_digit() && !prev.map_or(false, is_ident_char) => {
                while chars
                    .peek()
                    .map_or(false, |n| n.is_ascii_digit() || *n == '.')
                {
                    chars.next();
                }
                out.push('?');
                prev = Some('?');
            }
            c if c.is_whitespace() => {
                if !out.is_empty() && !out.ends_with(' ') {
                    out.push(' ');
                }
                prev = Some(' ');
            }
            c => {
                out.push(c);
                prev = Some(c);
            }
        }
    }

    out.trim_end().to_string()
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Substitute bound parameters into the statement text.
///
/// Handles `?` and `$N` placeholders outside quoted literals. Placeholders
/// without a matching parameter are left as they are.
pub fn render(sql: &str, params: &[Value]) -> String {
    if params.is_empty() {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut chars = sql.chars().peekable();
    let mut positional = 0;
    let mut in_quote = false;

    while let Some(c) = chars.next() {
        if in_quote {
            out.push(c);
            if c == '\'' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_quote = true;
                out.push(c);
            }
            '?' => match params.get(positional) {
                Some(value) => {
                    out.push_str(&render_value(value));
                    positional += 1;
                }
                None => out.push(c),
            },
            '$' if chars.peek().map_or(false, char::is_ascii_digit) => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                let value = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|n| params.get(n));
                match value {
                    Some(value) => out.push_str(&render_value(value)),
                    None => {
                        out.push('$');
                        out.push_str(&digits);
                    }
                }
            }
            c => out.push(c),
        }
    }
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Boolean(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        Value::TinyInt(n) => n.to_string(),
        Value::SmallInt(n) => n.to_string(),
        Value::Int(n) => n.to_string(),
        Value::BigInt(n) => n.to_string(),
        Value::HugeInt(n) => n.to_string(),
        Value::UTinyInt(n) => n.to_string(),
        Value::USmallInt(n) => n.to_string(),
        Value::UInt(n) => n.to_string(),
        Value::UBigInt(n) => n.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Double(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(b) => format!("<blob {} bytes>", b.len()),
        other => format!("{:?}", other),
    }
}

/// Whether a statement reads or writes spool's own tables.
///
/// Table names must appear as whole identifiers, so `myspool_profiles_archive`
/// is an application table.
pub fn touches_spool_tables(sql: &str) -> bool {
    sql.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|word| SPOOL_TABLES.iter().any(|table| word.eq_ignore_ascii_case(table)))
}

/// Call stack at the point of execution, innermost frame first.
///
/// Frames belonging to the capture itself are dropped. Empty when the
/// platform cannot produce a backtrace.
pub fn capture_traceback() -> String {
    let backtrace = Backtrace::force_capture();
    if backtrace.status() != BacktraceStatus::Captured {
        return String::new();
    }

    let rendered = backtrace.to_string();
    let mut frames: Vec<Vec<&str>> = Vec::new();
    for line in rendered.lines() {
        let trimmed = line.trim_start();
        let starts_frame = trimmed
            .split_once(": ")
            .map_or(false, |(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        if starts_frame {
            frames.push(vec![line]);
        } else if let Some(frame) = frames.last_mut() {
            frame.push(line);
        }
    }

    frames
        .into_iter()
        .skip_while(|frame| {
            let head = frame.first().copied().unwrap_or_default();
            head.contains("std::backtrace") || head.contains("spool::sql::")
        })
        .flatten()
        .collect::<Vec<_>>()
        .join("\n")
}

/// Records statements executed through it with the current collector.
#[derive(Debug, Clone, Default)]
pub struct QueryInterceptor {
    ignore_queries: Vec<String>,
    analyze_queries: bool,
    capture_traceback: bool,
}

impl QueryInterceptor {
    pub fn new(config: &Config) -> Self {
        Self {
            ignore_queries: config.ignore_queries.clone(),
            analyze_queries: config.analyze_queries,
            capture_traceback: true,
        }
    }

    /// Skip stack capture, which dominates the interception cost.
    pub fn without_traceback(mut self) -> Self {
        self.capture_traceback = false;
        self
    }

    pub fn analyze_queries(&self) -> bool {
        self.analyze_queries
    }

    /// Whether a rendered statement should be recorded at all.
    pub fn should_record(&self, rendered: &str) -> bool {
        let head = rendered.trim_start().to_uppercase();
        if SKIPPED_PREFIXES.iter().any(|p| head.starts_with(p)) {
            return false;
        }
        !self
            .ignore_queries
            .iter()
            .any(|ignored| rendered.contains(ignored.as_str()))
    }

    /// Run `exec` and record it as `sql` with `params`.
    pub fn execute<T, E, F>(&self, sql: &str, params: &[Value], exec: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: From<Error>,
    {
        self.execute_explained(sql, params, exec, |_| None)
    }

    /// Like [`execute`](Self::execute), attaching `explain(rendered)` as the
    /// query analysis when analysis is enabled.
    ///
    /// Errors from `exec` are returned unchanged. A collector that has been
    /// cleared surfaces as [`Error::NotConfigured`] after a successful `exec`;
    /// other bookkeeping failures are only logged.
    pub fn execute_explained<T, E, F, X>(
        &self,
        sql: &str,
        params: &[Value],
        exec: F,
        explain: X,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        X: FnOnce(&str) -> Option<String>,
        E: From<Error>,
    {
        let Some(collector) = Collector::current() else {
            return exec();
        };

        let rendered = render(sql, params);
        if !self.should_record(&rendered) {
            return exec();
        }

        let mut query = QueryRecord::new(rendered);
        if self.capture_traceback {
            query.traceback = capture_traceback();
        }

        query.start_time = Utc::now();
        let result = exec();
        query.end_time = Some(Utc::now());
        query.request_id = collector.request_id();

        let registered = if touches_spool_tables(&query.query) {
            collector.register_internal_query(query)
        } else {
            if self.analyze_queries && result.is_ok() {
                query.analysis = explain(&query.query);
            }
            collector.register_query(query)
        };

        match registered {
            Ok(_) => result,
            Err(e @ Error::NotConfigured(_)) => match result {
                Ok(_) => Err(e.into()),
                Err(driver) => Err(driver),
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to record query");
                result
            }
        }
    }
}

/// A DuckDB connection whose statements are recorded.
pub struct TracedConnection {
    conn: Connection,
    interceptor: QueryInterceptor,
}

/// Wrap a connection with query recording.
///
/// Wrapping is idempotent: tracing an already traced connection returns it
/// unchanged, so the interceptor never runs twice for one statement.
pub trait Traced {
    fn traced(self, interceptor: QueryInterceptor) -> TracedConnection;
}

impl Traced for Connection {
    fn traced(self, interceptor: QueryInterceptor) -> TracedConnection {
        TracedConnection {
            conn: self,
            interceptor,
        }
    }
}

impl Traced for TracedConnection {
    fn traced(self, _interceptor: QueryInterceptor) -> TracedConnection {
        self
    }
}

impl TracedConnection {
    /// Open an application database with the interceptor built from `config`.
    pub fn open(path: impl AsRef<std::path::Path>, config: &Config) -> Result<Self> {
        Ok(Connection::open(path)?.traced(QueryInterceptor::new(config)))
    }

    pub fn open_in_memory(config: &Config) -> Result<Self> {
        Ok(Connection::open_in_memory()?.traced(QueryInterceptor::new(config)))
    }

    pub fn interceptor(&self) -> &QueryInterceptor {
        &self.interceptor
    }

    /// The underlying connection. Statements run on it are not recorded.
    pub fn inner(&self) -> &Connection {
        &self.conn
    }

    pub fn into_inner(self) -> Connection {
        self.conn
    }

    /// Execute one statement, returning the number of changed rows.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.interceptor.execute_explained(
            sql,
            params,
            || Ok(self.conn.execute(sql, params_from_iter(params.iter()))?),
            |rendered| self.explain(rendered),
        )
    }

    /// Execute several statements without parameters, recorded as one query.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.interceptor
            .execute(sql, &[], || Ok(self.conn.execute_batch(sql)?))
    }

    pub fn query_row<T, F>(&self, sql: &str, params: &[Value], f: F) -> Result<T>
    where
        F: FnOnce(&Row<'_>) -> duckdb::Result<T>,
    {
        self.interceptor.execute_explained(
            sql,
            params,
            || Ok(self.conn.query_row(sql, params_from_iter(params.iter()), f)?),
            |rendered| self.explain(rendered),
        )
    }

    pub fn query_map<T, F>(&self, sql: &str, params: &[Value], f: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> duckdb::Result<T>,
    {
        self.interceptor.execute_explained(
            sql,
            params,
            || {
                let mut stmt = self.conn.prepare(sql)?;
                let rows = stmt.query_map(params_from_iter(params.iter()), f)?;
                Ok(rows.collect::<duckdb::Result<Vec<T>>>()?)
            },
            |rendered| self.explain(rendered),
        )
    }

    /// Plan text for an already rendered statement.
    fn explain(&self, rendered: &str) -> Option<String> {
        let plan = (|| -> duckdb::Result<String> {
            let mut stmt = self.conn.prepare(&format!("EXPLAIN {}", rendered))?;
            let rows = stmt.query_map([], |row| {
                Ok(format!("{}\n{}", row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            Ok(rows.collect::<duckdb::Result<Vec<_>>>()?.join("\n"))
        })();

        match plan {
            Ok(plan) => Some(plan),
            Err(e) => {
                tracing::warn!(error = %e, query = rendered, "EXPLAIN failed");
                None
            }
        }
    }
}
