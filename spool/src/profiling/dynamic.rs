//! Profiling switched on by configuration.
//!
//! Call sites that might need profiling are marked with a key:
//!
//! ```ignore
//! let total = dynamic.call_site("orders::checkout", || checkout(&cart));
//! ```
//!
//! When `dynamic_profiling` in the config has an entry whose `function` is
//! that key, the call is profiled with `dynamic = true`; otherwise `f` runs
//! untouched. An entry with `start_line`/`end_line` records a block profile
//! over that line range, an entry without records a function profile.

use std::panic::Location;

use crate::config::DynamicProfile;
use crate::{Error, Result};

use super::{Profiled, Span};

/// Lookup table of configured call sites.
#[derive(Debug, Clone, Default)]
pub struct DynamicProfiler {
    entries: Vec<DynamicProfile>,
}

impl DynamicProfiler {
    /// Build from config entries. Each entry needs a `function` key and
    /// either both or neither of `start_line` and `end_line`.
    pub fn new(entries: &[DynamicProfile]) -> Result<Self> {
        for entry in entries {
            if entry.function.as_deref().map_or(true, str::is_empty) {
                return Err(Error::Config(format!("Invalid dynamic mapping {:?}", entry)));
            }
            if entry.start_line.is_some() != entry.end_line.is_some() {
                return Err(Error::Config(format!(
                    "Dynamic mapping needs both start_line and end_line: {:?}",
                    entry
                )));
            }
        }
        Ok(Self {
            entries: entries.to_vec(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry configured for `key`, if any.
    pub fn entry(&self, key: &str) -> Option<&DynamicProfile> {
        self.entries
            .iter()
            .find(|e| e.function.as_deref() == Some(key))
    }

    /// Run `f`, profiling it if `key` is configured.
    #[track_caller]
    pub fn call_site<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let location = Location::caller();
        let Some(entry) = self.entry(key) else {
            return f();
        };
        let name = entry.name.clone().unwrap_or_else(|| key.to_string());

        match (entry.start_line, entry.end_line) {
            (Some(start), Some(end)) => {
                let span = Span {
                    location,
                    ..Span::new(name)
                }
                .dynamic(start, end);
                match span.enter() {
                    Ok(active) => {
                        let out = f();
                        if let Err(e) = active.exit() {
                            tracing::warn!(error = %e, key, "failed to record dynamic profile");
                        }
                        out
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, key, "failed to start dynamic profile");
                        f()
                    }
                }
            }
            _ => {
                let wrapper = Profiled {
                    f: (),
                    name: Some(name),
                    func_name: key.rsplit("::").next().unwrap_or(key).to_string(),
                    location,
                    dynamic: true,
                };
                wrapper.call_once(f)
            }
        }
    }
}
