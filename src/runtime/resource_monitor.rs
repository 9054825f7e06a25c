// src/runtime/resource_monitor.rs
//! Live CPU and memory sampling for a process group
//!
//! Reads `/proc/<pid>/stat` for every member of the group at a fixed interval
//! and tracks running maxima. Sampling runs on a blocking thread next to the
//! process-wait path with no shared lock, so the last sample before exit may
//! be stale.

use crate::utils::errors::{Result, ToolkitError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Maxima observed over a process group's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Peak CPU percentage (100 = one full core)
    pub max_cpu_pct: f64,

    /// Peak resident memory in megabytes
    pub max_memory_mb: f64,

    /// Number of samples taken
    pub samples: u32,
}

impl ResourceUsage {
    fn record(&mut self, sample: Sample) {
        self.max_cpu_pct = self.max_cpu_pct.max(sample.cpu_pct);
        self.max_memory_mb = self.max_memory_mb.max(sample.memory_mb);
        self.samples += 1;
    }
}

/// One point-in-time reading of a process group
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub cpu_pct: f64,
    pub memory_mb: f64,
}

/// Per-process counters from /proc/<pid>/stat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    pgrp: i64,
    cpu_ticks: u64,
    rss_pages: u64,
}

/// Samples CPU and RSS for all processes in a group
pub struct ProcessSampler {
    pgid: i64,
    clock_ticks: f64,
    page_size: u64,
    last: Option<(Instant, u64)>,
}

impl ProcessSampler {
    /// Check that process introspection is available on this host
    pub fn probe() -> Result<()> {
        if !cfg!(target_os = "linux") {
            return Err(ToolkitError::ProcessIntrospection(
                "resource sampling requires /proc (Linux only)".into()
            ));
        }

        std::fs::read_to_string("/proc/self/stat")
            .map(|_| ())
            .map_err(|e| ToolkitError::ProcessIntrospection(
                format!("cannot read /proc/self/stat: {}", e)
            ))
    }

    /// Create a sampler for the group led by `pgid`
    pub fn new(pgid: u32) -> Result<Self> {
        Self::probe()?;

        let (clock_ticks, page_size) = system_constants();

        Ok(Self {
            pgid: i64::from(pgid),
            clock_ticks,
            page_size,
            last: None,
        })
    }

    /// Take one sample; `None` once no member of the group is left
    pub fn sample(&mut self) -> Option<Sample> {
        let members = read_group(self.pgid);
        if members.is_empty() {
            return None;
        }

        let now = Instant::now();
        let ticks: u64 = members.iter().map(|m| m.cpu_ticks).sum();
        let rss_pages: u64 = members.iter().map(|m| m.rss_pages).sum();

        // First reading only establishes the CPU baseline
        let cpu_pct = match self.last {
            Some((at, prev_ticks)) => {
                let wall = now.duration_since(at).as_secs_f64();
                if wall > 0.0 && ticks > prev_ticks {
                    (ticks - prev_ticks) as f64 / self.clock_ticks / wall * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((now, ticks));

        Some(Sample {
            cpu_pct,
            memory_mb: (rss_pages * self.page_size) as f64 / (1024.0 * 1024.0),
        })
    }
}

/// Background sampling loop with running maxima
pub struct ResourceMonitor {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<ResourceUsage>,
}

impl ResourceMonitor {
    /// Start sampling every `interval` until stopped or the group is gone
    pub fn start(mut sampler: ProcessSampler, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = tokio::task::spawn_blocking(move || {
            let mut usage = ResourceUsage::default();

            while !flag.load(Ordering::Acquire) {
                match sampler.sample() {
                    Some(sample) => {
                        trace!("Sampled group {}: {:?}", sampler.pgid, sample);
                        usage.record(sample);
                    }
                    None => break,
                }
                std::thread::sleep(interval);
            }

            usage
        });

        Self { stop, handle }
    }

    /// Stop sampling and return the maxima
    pub async fn finish(self) -> ResourceUsage {
        self.stop.store(true, Ordering::Release);

        match self.handle.await {
            Ok(usage) => usage,
            Err(e) => {
                debug!("Resource monitor ended abnormally: {}", e);
                ResourceUsage::default()
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn system_constants() -> (f64, u64) {
    // SAFETY: sysconf only reads configuration values
    let (ticks, page) = unsafe { (libc::sysconf(libc::_SC_CLK_TCK), libc::sysconf(libc::_SC_PAGESIZE)) };
    let ticks = if ticks > 0 { ticks as f64 } else { 100.0 };
    let page = if page > 0 { page as u64 } else { 4096 };
    (ticks, page)
}

#[cfg(not(target_os = "linux"))]
fn system_constants() -> (f64, u64) {
    (100.0, 4096)
}

/// Collect stats for every live process whose group is `pgid`
fn read_group(pgid: i64) -> Vec<ProcStat> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.bytes().all(|b| b.is_ascii_digit()))
                .unwrap_or(false)
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|raw| parse_stat(&raw))
        .filter(|stat| stat.pgrp == pgid)
        .collect()
}

/// Parse the fields we need out of a /proc/<pid>/stat line
fn parse_stat(raw: &str) -> Option<ProcStat> {
    // comm may contain spaces and parentheses; fields resume after the last ')'
    let rest = &raw[raw.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // fields[0] is state (stat field 3)
    let pgrp: i64 = fields.get(2)?.parse().ok()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let cutime: u64 = fields.get(13)?.parse::<i64>().ok()?.max(0) as u64;
    let cstime: u64 = fields.get(14)?.parse::<i64>().ok()?.max(0) as u64;
    let rss_pages: u64 = fields.get(21)?.parse::<i64>().ok()?.max(0) as u64;

    Some(ProcStat {
        pgrp,
        cpu_ticks: utime + stime + cutime + cstime,
        rss_pages,
    })
}
