//! Garbage collection of old requests.
//!
//! After a request is saved, a collection runs with probability
//! `max_recorded_requests_check_percent`. It keeps the
//! `max_recorded_requests` newest requests and deletes the rest together
//! with their queries, profiles, responses and sampler blobs.

use rand::Rng;

use super::Store;
use crate::Result;

/// Requests past the retention limit. Newest first, so the OFFSET skips
/// exactly the ones that are kept.
fn doomed(keep: usize) -> String {
    format!(
        "SELECT id FROM spool_requests ORDER BY start_time DESC, id DESC OFFSET {}",
        keep
    )
}

/// Statistics from a garbage collection run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcStats {
    pub requests_removed: usize,
    pub blobs_removed: usize,
}

impl Store {
    /// Roll the dice and collect garbage if they say so.
    pub fn maybe_collect_garbage(&self) -> Result<Option<GcStats>> {
        let percent = self.config.max_recorded_requests_check_percent;
        if percent == 0 || rand::thread_rng().gen_range(0..100) >= percent {
            return Ok(None);
        }
        self.collect_garbage().map(Some)
    }

    /// Delete everything but the newest `max_recorded_requests` requests.
    pub fn collect_garbage(&self) -> Result<GcStats> {
        let keep = self.config.max_recorded_requests;
        let doomed = doomed(keep);

        let (removed, blobs) = self.transaction(|conn| {
            let blobs: Vec<String> = {
                let sql = format!(
                    "SELECT prof_file FROM spool_requests \
                     WHERE prof_file IS NOT NULL AND id IN ({})",
                    doomed
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<duckdb::Result<_>>()?
            };

            let statements = [
                "DELETE FROM spool_profile_queries WHERE profile_id IN \
                 (SELECT id FROM spool_profiles WHERE request_id IN ({doomed}))",
                "DELETE FROM spool_profiles WHERE request_id IN ({doomed})",
                "DELETE FROM spool_sql_queries WHERE request_id IN ({doomed})",
                "DELETE FROM spool_responses WHERE request_id IN ({doomed})",
            ];
            for template in statements {
                conn.execute(&template.replace("{doomed}", &doomed), [])?;
            }
            let removed = conn.execute(
                &format!("DELETE FROM spool_requests WHERE id IN ({})", doomed),
                [],
            )?;
            Ok((removed, blobs))
        })?;

        let mut stats = GcStats {
            requests_removed: removed,
            blobs_removed: 0,
        };
        for name in blobs {
            match self.blobs.delete(&name) {
                Ok(true) => stats.blobs_removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, blob = %name, "failed to delete profile blob"),
            }
        }

        if stats.requests_removed > 0 {
            tracing::info!(
                removed = stats.requests_removed,
                blobs = stats.blobs_removed,
                kept = keep,
                "collected old requests"
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::initialize;
    use crate::schema::{QueryRecord, RequestRecord};
    use crate::store::ScopeSnapshot;
    use crate::Config;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn setup_store(keep: usize, percent: u8) -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_root(tmp.path());
        config.max_recorded_requests = keep;
        config.max_recorded_requests_check_percent = percent;
        initialize(&config).unwrap();
        let store = Store::open(config).unwrap();
        (tmp, store)
    }

    /// Save a request that started `age_ms` milliseconds ago.
    fn save_aged(store: &Store, age_ms: i64, blob: bool) -> RequestRecord {
        let mut request = RequestRecord::new("GET", "/orders");
        request.start_time -= Duration::milliseconds(age_ms);
        if blob {
            let name = format!("{}.prof", request.id);
            request.prof_file = Some(store.blobs().save(&name, b"{}").unwrap());
        }
        let mut query = QueryRecord::new("SELECT 1");
        query.identifier = Some(1);
        store
            .save_scope(
                &ScopeSnapshot {
                    request,
                    queries: BTreeMap::from([(1, query)]),
                    profiles: BTreeMap::new(),
                },
                None,
            )
            .unwrap()
    }

    #[test]
    fn test_collect_keeps_newest() {
        let (_tmp, store) = setup_store(2, 0);
        let oldest = save_aged(&store, 3_000, true);
        let old = save_aged(&store, 2_000, false);
        let newer = save_aged(&store, 1_000, false);
        let newest = save_aged(&store, 0, false);

        let stats = store.collect_garbage().unwrap();
        assert_eq!(stats.requests_removed, 2);
        assert_eq!(stats.blobs_removed, 1);

        assert_eq!(store.request_count().unwrap(), 2);
        assert_eq!(store.query_count().unwrap(), 2);
        assert!(store.request(&newest.id).unwrap().is_some());
        assert!(store.request(&newer.id).unwrap().is_some());
        assert!(store.request(&old.id).unwrap().is_none());
        assert!(!store.blobs().exists(oldest.prof_file.as_deref().unwrap()));
    }

    #[test]
    fn test_collect_under_limit_is_noop() {
        let (_tmp, store) = setup_store(10, 0);
        save_aged(&store, 0, false);

        assert_eq!(store.collect_garbage().unwrap(), GcStats::default());
        assert_eq!(store.request_count().unwrap(), 1);
    }

    #[test]
    fn test_zero_percent_never_collects() {
        let (_tmp, store) = setup_store(1, 0);
        for age in 0..3 {
            save_aged(&store, age, false);
        }
        assert!(store.maybe_collect_garbage().unwrap().is_none());
        assert_eq!(store.request_count().unwrap(), 3);
    }

    #[test]
    fn test_hundred_percent_collects_on_every_save() {
        let (_tmp, store) = setup_store(2, 100);
        for age in [500, 400, 300, 200, 100] {
            save_aged(&store, age, false);
        }
        assert_eq!(store.request_count().unwrap(), 2);
    }
}
