//! Reading stored requests back, and deleting them.

use std::collections::{BTreeSet, HashMap};

use duckdb::{params, Connection, Row};
use uuid::Uuid;

use super::{from_epoch_us, uuid_at, Store};
use crate::schema::{ProfileRecord, QueryRecord, RequestRecord, ResponseRecord};
use crate::Result;

/// A query as stored, with its durable id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredQuery {
    pub id: i64,
    pub record: QueryRecord,
}

/// A profile as stored.
///
/// `record.queries` holds the temp identifiers of the linked queries and
/// `query_ids` their durable ids.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProfile {
    pub id: i64,
    pub record: ProfileRecord,
    pub query_ids: Vec<i64>,
}

const REQUEST_COLUMNS: &str = "id, path, query_params, raw_body, body, method, \
    epoch_us(start_time), epoch_us(end_time), time_taken, encoded_headers, view_name, \
    num_sql_queries, num_duplicated_queries, meta_time, meta_num_queries, \
    meta_time_spent_queries, prof_file, profile_summary";

fn request_from_row(row: &Row<'_>) -> duckdb::Result<RequestRecord> {
    Ok(RequestRecord {
        id: uuid_at(row, 0)?,
        path: row.get(1)?,
        query_params: row.get(2)?,
        raw_body: row.get(3)?,
        body: row.get(4)?,
        method: row.get(5)?,
        start_time: from_epoch_us(row.get(6)?),
        end_time: row.get::<_, Option<i64>>(7)?.map(from_epoch_us),
        time_taken: row.get(8)?,
        encoded_headers: row.get(9)?,
        view_name: row.get(10)?,
        num_sql_queries: row.get(11)?,
        num_duplicated_queries: row.get(12)?,
        meta_time: row.get(13)?,
        meta_num_queries: row.get(14)?,
        meta_time_spent_queries: row.get(15)?,
        prof_file: row.get(16)?,
        profile_summary: row.get(17)?,
    })
}

impl Store {
    /// Get a stored request by id.
    pub fn request(&self, id: &Uuid) -> Result<Option<RequestRecord>> {
        let conn = self.connection()?;
        let sql = format!("SELECT {} FROM spool_requests WHERE id = ?", REQUEST_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id.to_string()], request_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Most recent requests first.
    pub fn requests(&self, limit: usize) -> Result<Vec<RequestRecord>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {} FROM spool_requests ORDER BY start_time DESC, id DESC LIMIT ?",
            REQUEST_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], request_from_row)?;
        Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
    }

    pub fn request_count(&self) -> Result<usize> {
        count(&self.connection()?, "spool_requests")
    }

    pub fn query_count(&self) -> Result<usize> {
        count(&self.connection()?, "spool_sql_queries")
    }

    pub fn profile_count(&self) -> Result<usize> {
        count(&self.connection()?, "spool_profiles")
    }

    /// The response stored for a request, if one was produced.
    pub fn response_for(&self, request_id: &Uuid) -> Result<Option<ResponseRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, request_id, status_code, raw_body, body, encoded_headers \
             FROM spool_responses WHERE request_id = ?",
        )?;
        let mut rows = stmt.query_map(params![request_id.to_string()], |row| {
            Ok(ResponseRecord {
                id: uuid_at(row, 0)?,
                request_id: uuid_at(row, 1)?,
                status_code: row.get::<_, i32>(2)? as u16,
                raw_body: row.get(3)?,
                body: row.get(4)?,
                encoded_headers: row.get(5)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    /// Queries of a request in execution order.
    pub fn queries_for_request(&self, request_id: &Uuid) -> Result<Vec<StoredQuery>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, identifier, query, query_structure, epoch_us(start_time), \
             epoch_us(end_time), traceback, analysis \
             FROM spool_sql_queries WHERE request_id = ? ORDER BY identifier, id",
        )?;
        let rows = stmt.query_map(params![request_id.to_string()], |row| {
            Ok(StoredQuery {
                id: row.get(0)?,
                record: QueryRecord {
                    identifier: row.get::<_, Option<i64>>(1)?.map(|i| i as u64),
                    request_id: Some(*request_id),
                    query: row.get(2)?,
                    query_structure: row.get(3)?,
                    start_time: row
                        .get::<_, Option<i64>>(4)?
                        .map(from_epoch_us)
                        .unwrap_or_default(),
                    end_time: row.get::<_, Option<i64>>(5)?.map(from_epoch_us),
                    traceback: row.get(6)?,
                    analysis: row.get(7)?,
                },
            })
        })?;
        Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
    }

    /// Profiles of a request with their linked queries resolved.
    pub fn profiles_for_request(&self, request_id: &Uuid) -> Result<Vec<StoredProfile>> {
        let conn = self.connection()?;

        let mut links: HashMap<i64, Vec<(i64, Option<u64>)>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT pq.profile_id, q.id, q.identifier \
                 FROM spool_profile_queries pq \
                 JOIN spool_sql_queries q ON q.id = pq.sql_query_id \
                 JOIN spool_profiles p ON p.id = pq.profile_id \
                 WHERE p.request_id = ? ORDER BY q.id",
            )?;
            let rows = stmt.query_map(params![request_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?.map(|i| i as u64),
                ))
            })?;
            for row in rows {
                let (profile_id, query_id, identifier) = row?;
                links.entry(profile_id).or_default().push((query_id, identifier));
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, name, file_path, line_num, end_line_num, func_name, \
             epoch_us(start_time), epoch_us(end_time), exception_raised, dynamic \
             FROM spool_profiles WHERE request_id = ? ORDER BY start_time, id",
        )?;
        let rows = stmt.query_map(params![request_id.to_string()], |row| {
            let file_path: String = row.get(2)?;
            Ok((
                row.get::<_, i64>(0)?,
                ProfileRecord {
                    identifier: None,
                    request_id: Some(*request_id),
                    name: row.get(1)?,
                    file_path: (!file_path.is_empty()).then_some(file_path),
                    line_num: row.get::<_, Option<i32>>(3)?.map(|n| n as u32),
                    end_line_num: row.get::<_, Option<i32>>(4)?.map(|n| n as u32),
                    func_name: row.get(5)?,
                    start_time: from_epoch_us(row.get(6)?),
                    end_time: row.get::<_, Option<i64>>(7)?.map(from_epoch_us),
                    exception_raised: row.get(8)?,
                    dynamic: row.get(9)?,
                    queries: BTreeSet::new(),
                },
            ))
        })?;

        let mut profiles = Vec::new();
        for row in rows {
            let (id, mut record) = row?;
            let linked = links.remove(&id).unwrap_or_default();
            record.queries = linked.iter().filter_map(|(_, ident)| *ident).collect();
            profiles.push(StoredProfile {
                id,
                record,
                query_ids: linked.into_iter().map(|(qid, _)| qid).collect(),
            });
        }
        Ok(profiles)
    }

    /// Delete a request with everything that hangs off it, and its blob.
    ///
    /// Returns false if no such request was stored.
    pub fn delete_request(&self, id: &Uuid) -> Result<bool> {
        let prof_file = self.transaction(|conn| delete_request_rows(conn, &id.to_string()))?;
        let Some(prof_file) = prof_file else {
            return Ok(false);
        };
        if let Some(name) = prof_file {
            if let Err(e) = self.blobs.delete(&name) {
                tracing::warn!(error = %e, blob = %name, "failed to delete profile blob");
            }
        }
        Ok(true)
    }

    /// Delete every stored request and blob.
    pub fn clear_all(&self) -> Result<usize> {
        let blobs: Vec<String> = {
            let conn = self.connection()?;
            let mut stmt =
                conn.prepare("SELECT prof_file FROM spool_requests WHERE prof_file IS NOT NULL")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<duckdb::Result<_>>()?
        };

        let removed = self.transaction(|conn| {
            let n = count(conn, "spool_requests")?;
            conn.execute_batch(
                "DELETE FROM spool_profile_queries;
                 DELETE FROM spool_profiles;
                 DELETE FROM spool_sql_queries;
                 DELETE FROM spool_responses;
                 DELETE FROM spool_requests;",
            )?;
            Ok(n)
        })?;

        for name in blobs {
            if let Err(e) = self.blobs.delete(&name) {
                tracing::warn!(error = %e, blob = %name, "failed to delete profile blob");
            }
        }
        tracing::info!(removed, "cleared all requests");
        Ok(removed)
    }
}

fn count(conn: &Connection, table: &str) -> Result<usize> {
    let sql = format!("SELECT COUNT(*) FROM {}", table);
    let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(n as usize)
}

/// Delete one request's rows. Returns `None` if the request did not exist,
/// otherwise its blob name.
pub(super) fn delete_request_rows(
    conn: &Connection,
    request_id: &str,
) -> Result<Option<Option<String>>> {
    let existing = {
        let mut stmt = conn.prepare("SELECT prof_file FROM spool_requests WHERE id = ?")?;
        let mut rows =
            stmt.query_map(params![request_id], |row| row.get::<_, Option<String>>(0))?;
        rows.next().transpose()?
    };
    let Some(prof_file) = existing else {
        return Ok(None);
    };

    conn.execute(
        "DELETE FROM spool_profile_queries WHERE profile_id IN \
         (SELECT id FROM spool_profiles WHERE request_id = ?)",
        params![request_id],
    )?;
    conn.execute("DELETE FROM spool_profiles WHERE request_id = ?", params![request_id])?;
    conn.execute("DELETE FROM spool_sql_queries WHERE request_id = ?", params![request_id])?;
    conn.execute("DELETE FROM spool_responses WHERE request_id = ?", params![request_id])?;
    conn.execute("DELETE FROM spool_requests WHERE id = ?", params![request_id])?;
    Ok(Some(prof_file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::initialize;
    use crate::store::ScopeSnapshot;
    use crate::Config;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn setup_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_root(tmp.path());
        config.max_recorded_requests_check_percent = 0;
        initialize(&config).unwrap();
        let store = Store::open(config).unwrap();
        (tmp, store)
    }

    fn save(store: &Store, path: &str, queries: &[&str]) -> RequestRecord {
        let mut request = RequestRecord::new("GET", path);
        request.end_time = Some(request.start_time + Duration::milliseconds(5));
        request.derive_time_taken();

        let mut query_map = BTreeMap::new();
        for (i, sql) in queries.iter().enumerate() {
            let mut query = QueryRecord::new(*sql);
            query.identifier = Some(i as u64 + 1);
            query_map.insert(i as u64 + 1, query);
        }
        let snapshot = ScopeSnapshot {
            request,
            queries: query_map,
            profiles: BTreeMap::new(),
        };
        store.save_scope(&snapshot, None).unwrap()
    }

    #[test]
    fn test_request_round_trip() {
        let (_tmp, store) = setup_store();
        let saved = save(&store, "/orders", &["SELECT 1"]);

        let loaded = store.request(&saved.id).unwrap().unwrap();
        assert_eq!(loaded.path, "/orders");
        assert_eq!(loaded.num_sql_queries, 1);
        assert_eq!(loaded.time_taken, saved.time_taken);
        assert_eq!(
            loaded.start_time.timestamp_micros(),
            saved.start_time.timestamp_micros()
        );

        assert!(store.request(&Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_requests_newest_first() {
        let (_tmp, store) = setup_store();
        let first = save(&store, "/a", &[]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = save(&store, "/b", &[]);

        let listed = store.requests(10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
        assert_eq!(store.requests(1).unwrap().len(), 1);
    }

    #[test]
    fn test_queries_for_request_in_order() {
        let (_tmp, store) = setup_store();
        let saved = save(&store, "/a", &["SELECT 1", "SELECT 2", "SELECT 3"]);

        let queries = store.queries_for_request(&saved.id).unwrap();
        let texts: Vec<_> = queries.iter().map(|q| q.record.query.as_str()).collect();
        assert_eq!(texts, vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
        assert!(queries.iter().all(|q| q.record.request_id == Some(saved.id)));
    }

    #[test]
    fn test_delete_request() {
        let (_tmp, store) = setup_store();
        let keep = save(&store, "/keep", &["SELECT 1"]);
        let gone = save(&store, "/gone", &["SELECT 1", "SELECT 2"]);

        assert!(store.delete_request(&gone.id).unwrap());
        assert!(!store.delete_request(&gone.id).unwrap());
        assert_eq!(store.request_count().unwrap(), 1);
        assert_eq!(store.query_count().unwrap(), 1);
        assert!(store.request(&keep.id).unwrap().is_some());
    }

    #[test]
    fn test_clear_all_removes_blobs() {
        let (_tmp, store) = setup_store();
        let mut request = RequestRecord::new("GET", "/profiled");
        request.prof_file = Some(store.blobs().save("profiled.prof", b"{}").unwrap());
        let name = request.prof_file.clone().unwrap();
        store
            .save_scope(
                &ScopeSnapshot {
                    request,
                    queries: BTreeMap::new(),
                    profiles: BTreeMap::new(),
                },
                None,
            )
            .unwrap();
        save(&store, "/plain", &[]);

        assert_eq!(store.clear_all().unwrap(), 2);
        assert_eq!(store.request_count().unwrap(), 0);
        assert!(!store.blobs().exists(&name));
    }
}
