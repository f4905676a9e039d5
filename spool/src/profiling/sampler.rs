//! Wall-clock sampling profiler.
//!
//! Spans push their names onto the scope's [`SpanStack`]. A background thread
//! wakes every interval and counts the stack it sees, rooted at `<request>`.
//! The result is a cheap flat profile of where the request spent its time,
//! at span granularity.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Root frame of every sampled stack.
pub const ROOT_FRAME: &str = "<request>";

/// Names of the spans currently open in one scope, outermost first.
#[derive(Debug, Clone, Default)]
pub struct SpanStack {
    frames: Arc<Mutex<Vec<String>>>,
}

impl SpanStack {
    pub fn push(&self, name: &str) {
        self.frames.lock().push(name.to_string());
    }

    pub fn pop(&self) {
        self.frames.lock().pop();
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    /// Current stack as `<request>;outer;inner`.
    pub fn render(&self) -> String {
        let frames = self.frames.lock();
        let mut out = String::from(ROOT_FRAME);
        for frame in frames.iter() {
            out.push(';');
            out.push_str(frame);
        }
        out
    }
}

/// Output of one sampler run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReport {
    pub interval_us: u64,
    pub elapsed_ms: f64,
    pub total_samples: u64,
    /// Rendered stack -> number of samples that saw it.
    pub stacks: BTreeMap<String, u64>,
}

impl SampleReport {
    /// Human-readable summary, at most `max_lines` lines.
    pub fn summary(&self, max_lines: usize) -> String {
        let mut rows: Vec<(&String, &u64)> = self.stacks.iter().collect();
        rows.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        let mut lines = vec![
            format!(
                "{} samples in {:.3} ms (interval {} us)",
                self.total_samples, self.elapsed_ms, self.interval_us
            ),
            String::new(),
            format!("{:>8}  {:>6}  stack", "samples", "%"),
        ];
        for (stack, count) in rows {
            let pct = if self.total_samples == 0 {
                0.0
            } else {
                *count as f64 * 100.0 / self.total_samples as f64
            };
            lines.push(format!("{:>8}  {:>5.1}%  {}", count, pct, stack));
        }

        lines.truncate(max_lines);
        lines.join("\n")
    }
}

/// A running sampler thread. Stopped explicitly or on drop.
#[derive(Debug)]
pub struct Sampler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<BTreeMap<String, u64>>>,
    started: Instant,
    interval: Duration,
}

impl Sampler {
    /// Spawn a sampler over `stack`.
    pub fn start(stack: SpanStack, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("spool-sampler".to_string())
            .spawn(move || {
                let mut counts = BTreeMap::new();
                while !flag.load(Ordering::Acquire) {
                    *counts.entry(stack.render()).or_insert(0) += 1;
                    thread::park_timeout(interval);
                }
                counts
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
            started: Instant::now(),
            interval,
        })
    }

    /// Stop the thread and collect its counts.
    pub fn stop(mut self) -> SampleReport {
        let stacks = self.shutdown().unwrap_or_default();
        SampleReport {
            interval_us: self.interval.as_micros() as u64,
            elapsed_ms: self.started.elapsed().as_secs_f64() * 1_000.0,
            total_samples: stacks.values().sum(),
            stacks,
        }
    }

    fn shutdown(&mut self) -> Option<BTreeMap<String, u64>> {
        let handle = self.handle.take()?;
        self.stop.store(true, Ordering::Release);
        handle.thread().unpark();
        match handle.join() {
            Ok(counts) => Some(counts),
            Err(_) => {
                tracing::warn!("sampling profiler thread panicked");
                None
            }
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
