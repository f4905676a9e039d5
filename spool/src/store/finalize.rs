//! Persisting a finished scope.

use std::collections::HashMap;

use duckdb::types::Value;
use duckdb::{params, params_from_iter, Connection};

use super::{ts_param, ScopeSnapshot, Store};
use crate::schema::{RequestRecord, ResponseRecord};
use crate::{Error, Result};

fn opt_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| Value::Text(s.to_string()))
}

fn opt_double(value: Option<f64>) -> Value {
    value.map_or(Value::Null, Value::Double)
}

fn opt_bigint(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::BigInt)
}

fn opt_int(value: Option<u32>) -> Value {
    value.map_or(Value::Null, |n| Value::Int(n as i32))
}

/// `(?, ?, ...), (?, ?, ...)` for a multi-row insert.
fn placeholders(rows: usize, columns: usize) -> String {
    let row = format!("({})", vec!["?"; columns].join(", "));
    vec![row; rows].join(", ")
}

impl Store {
    /// Write a scope's request, response, queries and profiles atomically.
    ///
    /// The request row is written first; queries go in with one multi-row
    /// insert and the request's query counter is bumped in the same
    /// transaction. Profiles are then linked to the durable ids of their
    /// queries. A request that is already stored is left untouched, which
    /// makes a repeated save of the same scope a no-op.
    ///
    /// Returns the request as stored.
    pub fn save_scope(
        &self,
        snapshot: &ScopeSnapshot,
        response: Option<&ResponseRecord>,
    ) -> Result<RequestRecord> {
        let saved = self.transaction(|conn| save_scope_inner(conn, snapshot, response))?;

        if let Err(e) = self.maybe_collect_garbage() {
            tracing::warn!(error = %e, "garbage collection failed");
        }
        Ok(saved)
    }
}

fn save_scope_inner(
    conn: &Connection,
    snapshot: &ScopeSnapshot,
    response: Option<&ResponseRecord>,
) -> Result<RequestRecord> {
    let request = &snapshot.request;
    let request_id = request.id.to_string();

    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM spool_requests WHERE id = ?",
        params![&request_id],
        |row| row.get(0),
    )?;
    if exists > 0 {
        tracing::debug!(request_id = %request.id, "request already stored, skipping");
        let mut stored = request.clone();
        stored.num_sql_queries = read_num_queries(conn, &request_id)?;
        return Ok(stored);
    }

    insert_request(conn, request)?;
    if let Some(response) = response {
        insert_response(conn, response)?;
    }

    // Queries: one insert, one counter update.
    if !snapshot.queries.is_empty() {
        let mut values = Vec::with_capacity(snapshot.queries.len() * 9);
        for (ident, query) in &snapshot.queries {
            values.extend([
                Value::BigInt(*ident as i64),
                Value::Text(request_id.clone()),
                Value::Text(query.query.clone()),
                Value::Text(query.query_structure.clone()),
                Value::Text(ts_param(&query.start_time)),
                opt_text(query.end_time.as_ref().map(ts_param).as_deref()),
                opt_double(query.time_taken()),
                Value::Text(query.traceback.clone()),
                opt_text(query.analysis.as_deref()),
            ]);
        }
        let sql = format!(
            "INSERT INTO spool_sql_queries \
             (identifier, request_id, query, query_structure, start_time, end_time, time_taken, traceback, analysis) \
             VALUES {}",
            placeholders(snapshot.queries.len(), 9)
        );
        conn.execute(&sql, params_from_iter(values))?;
        conn.execute(
            "UPDATE spool_requests SET num_sql_queries = num_sql_queries + ? WHERE id = ?",
            params![snapshot.queries.len() as i64, &request_id],
        )?;
    }

    // temp identifier -> durable id
    let durable: HashMap<u64, i64> = {
        let mut stmt = conn.prepare(
            "SELECT identifier, id FROM spool_sql_queries WHERE request_id = ? AND identifier IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![&request_id], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)?))
        })?;
        rows.collect::<duckdb::Result<_>>()?
    };

    for (ident, profile) in &snapshot.profiles {
        let mut query_ids = Vec::with_capacity(profile.queries.len());
        for temp_id in &profile.queries {
            let id = durable.get(temp_id).ok_or_else(|| {
                Error::InternalInconsistency(format!(
                    "Profile {} references query temp id {} that was never stored",
                    ident, temp_id
                ))
            })?;
            query_ids.push(*id);
        }

        let profile_id: i64 = conn.query_row(
            "INSERT INTO spool_profiles \
             (request_id, name, file_path, line_num, end_line_num, func_name, start_time, end_time, time_taken, exception_raised, dynamic) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            params_from_iter([
                Value::Text(request_id.clone()),
                Value::Text(profile.name.clone()),
                Value::Text(profile.file_path.clone().unwrap_or_default()),
                opt_int(profile.line_num),
                opt_int(profile.end_line_num),
                opt_text(profile.func_name.as_deref()),
                Value::Text(ts_param(&profile.start_time)),
                opt_text(profile.end_time.as_ref().map(ts_param).as_deref()),
                opt_double(profile.time_taken()),
                Value::Boolean(profile.exception_raised),
                Value::Boolean(profile.dynamic),
            ]),
            |row| row.get(0),
        )?;

        if !query_ids.is_empty() {
            let sql = format!(
                "INSERT INTO spool_profile_queries (profile_id, sql_query_id) VALUES {}",
                placeholders(query_ids.len(), 2)
            );
            let values = query_ids
                .iter()
                .flat_map(|id| [Value::BigInt(profile_id), Value::BigInt(*id)]);
            conn.execute(&sql, params_from_iter(values))?;
        }
    }

    let mut stored = request.clone();
    stored.num_sql_queries = read_num_queries(conn, &request_id)?;
    tracing::debug!(
        request_id = %request.id,
        queries = snapshot.queries.len(),
        profiles = snapshot.profiles.len(),
        "saved request scope"
    );
    Ok(stored)
}

fn read_num_queries(conn: &Connection, request_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT num_sql_queries FROM spool_requests WHERE id = ?",
        params![request_id],
        |row| row.get(0),
    )?)
}

fn insert_request(conn: &Connection, request: &RequestRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO spool_requests \
         (id, path, query_params, raw_body, body, method, start_time, end_time, time_taken, \
          encoded_headers, view_name, num_sql_queries, num_duplicated_queries, meta_time, \
          meta_num_queries, meta_time_spent_queries, prof_file, profile_summary) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (id) DO NOTHING",
        params_from_iter([
            Value::Text(request.id.to_string()),
            Value::Text(request.path.clone()),
            Value::Text(request.query_params.clone()),
            Value::Text(request.raw_body.clone()),
            Value::Text(request.body.clone()),
            Value::Text(request.method.clone()),
            Value::Text(ts_param(&request.start_time)),
            opt_text(request.end_time.as_ref().map(ts_param).as_deref()),
            opt_double(request.time_taken),
            Value::Text(request.encoded_headers.clone()),
            opt_text(request.view_name.as_deref()),
            opt_bigint(request.num_duplicated_queries),
            opt_double(request.meta_time),
            opt_bigint(request.meta_num_queries),
            opt_double(request.meta_time_spent_queries),
            opt_text(request.prof_file.as_deref()),
            Value::Text(request.profile_summary.clone()),
        ]),
    )?;
    Ok(())
}

fn insert_response(conn: &Connection, response: &ResponseRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO spool_responses (id, request_id, status_code, raw_body, body, encoded_headers) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (request_id) DO NOTHING",
        params![
            response.id.to_string(),
            response.request_id.to_string(),
            response.status_code as i32,
            &response.raw_body,
            &response.body,
            &response.encoded_headers,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::initialize;
    use crate::schema::{ProfileRecord, QueryRecord};
    use crate::Config;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn setup_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_root(tmp.path());
        config.max_recorded_requests_check_percent = 0;
        initialize(&config).unwrap();
        let store = Store::open(config).unwrap();
        (tmp, store)
    }

    fn snapshot(queries: u64, profile_queries: &[u64]) -> ScopeSnapshot {
        let request = RequestRecord::new("GET", "/orders");
        let mut query_map = BTreeMap::new();
        for ident in 1..=queries {
            let mut query = QueryRecord::new(format!("SELECT * FROM orders WHERE id = {}", ident));
            query.identifier = Some(ident);
            query.end_time = Some(query.start_time);
            query_map.insert(ident, query);
        }
        let mut profiles = BTreeMap::new();
        let mut profile = ProfileRecord::new("load");
        profile.identifier = Some(queries + 1);
        profile.queries = profile_queries.iter().copied().collect::<BTreeSet<_>>();
        profiles.insert(queries + 1, profile);
        ScopeSnapshot {
            request,
            queries: query_map,
            profiles,
        }
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(2, 3), "(?, ?, ?), (?, ?, ?)");
    }

    #[test]
    fn test_save_scope_writes_everything() {
        let (_tmp, store) = setup_store();
        let snapshot = snapshot(4, &[2, 3]);

        let saved = store.save_scope(&snapshot, None).unwrap();
        assert_eq!(saved.num_sql_queries, 4);
        assert_eq!(store.query_count().unwrap(), 4);
        assert_eq!(store.profile_count().unwrap(), 1);

        let profiles = store.profiles_for_request(&snapshot.request.id).unwrap();
        assert_eq!(profiles[0].record.queries, BTreeSet::from([2, 3]));
        assert_eq!(profiles[0].query_ids.len(), 2);
    }

    #[test]
    fn test_unresolvable_profile_query_is_internal_inconsistency() {
        let (_tmp, store) = setup_store();
        let snapshot = snapshot(1, &[1, 99]);

        let result = store.save_scope(&snapshot, None);
        assert!(matches!(result, Err(Error::InternalInconsistency(_))));
        // Nothing partial is left behind.
        assert_eq!(store.request_count().unwrap(), 0);
        assert_eq!(store.query_count().unwrap(), 0);
    }

    #[test]
    fn test_save_scope_twice_is_noop() {
        let (_tmp, store) = setup_store();
        let snapshot = snapshot(2, &[]);
        let response = ResponseRecord {
            id: Uuid::now_v7(),
            request_id: snapshot.request.id,
            status_code: 200,
            raw_body: String::new(),
            body: String::new(),
            encoded_headers: "{}".to_string(),
        };

        store.save_scope(&snapshot, Some(&response)).unwrap();
        let again = store.save_scope(&snapshot, Some(&response)).unwrap();
        assert_eq!(again.num_sql_queries, 2);
        assert_eq!(store.query_count().unwrap(), 2);
        assert_eq!(store.request_count().unwrap(), 1);
        assert!(store.response_for(&snapshot.request.id).unwrap().is_some());
    }
}
