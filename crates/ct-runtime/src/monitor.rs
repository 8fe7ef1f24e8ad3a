//! CPU/RAM sampling for process targets.
//!
//! Sampling reads `/proc/<pid>` on Linux. Everywhere else, and for in-process
//! targets, the consumption report stays all-zero, which callers treat as
//! "monitoring unavailable".

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Clock ticks per second for `/proc/<pid>/stat` time fields.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Expected upper bounds for the target, reported next to the observed values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub expected_max_cpu_percent: f64,
    pub expected_max_ram_mib: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConsumption {
    pub cpu_percent_avg: f64,
    pub cpu_percent_max: f64,
    pub cpu_percent_limit: f64,
    pub ram_mib_avg: f64,
    pub ram_mib_max: f64,
    pub ram_mib_limit: f64,
}

impl ResourceConsumption {
    /// True when nothing was ever sampled.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcSample {
    pub cpu_ticks: u64,
    pub rss_kib: u64,
}

#[derive(Debug)]
pub struct ResourceMonitor {
    pid: u32,
    spec: ResourceSpec,
    last: Option<(Instant, u64)>,
    cpu_samples: Vec<f64>,
    ram_samples: Vec<f64>,
}

impl ResourceMonitor {
    #[must_use]
    pub fn new(pid: u32, spec: ResourceSpec) -> Self {
        Self {
            pid,
            spec,
            last: None,
            cpu_samples: Vec::new(),
            ram_samples: Vec::new(),
        }
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Takes one sample. Returns `None` once the process is gone or cannot
    /// be read on this platform.
    pub fn sample(&mut self) -> Option<(f64, f64)> {
        let sample = read_proc_sample(self.pid)?;
        Some(self.record(Instant::now(), sample))
    }

    fn record(&mut self, now: Instant, sample: ProcSample) -> (f64, f64) {
        let ram_mib = sample.rss_kib as f64 / 1024.0;
        self.ram_samples.push(ram_mib);
        let cpu_percent = match self.last {
            Some((at, ticks)) => {
                let wall = now.duration_since(at).as_secs_f64();
                if wall > 0.0 {
                    let busy = sample.cpu_ticks.saturating_sub(ticks) as f64 / CLOCK_TICKS_PER_SEC;
                    busy / wall * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        if self.last.is_some() {
            self.cpu_samples.push(cpu_percent);
        }
        self.last = Some((now, sample.cpu_ticks));
        (cpu_percent, ram_mib)
    }

    #[must_use]
    pub fn total(&self) -> ResourceConsumption {
        let (cpu_percent_avg, cpu_percent_max) = avg_max(&self.cpu_samples);
        let (ram_mib_avg, ram_mib_max) = avg_max(&self.ram_samples);
        ResourceConsumption {
            cpu_percent_avg,
            cpu_percent_max,
            cpu_percent_limit: self.spec.expected_max_cpu_percent,
            ram_mib_avg,
            ram_mib_max,
            ram_mib_limit: self.spec.expected_max_ram_mib,
        }
    }
}

fn avg_max(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let sum: f64 = samples.iter().sum();
    let max = samples.iter().copied().fold(0.0_f64, f64::max);
    (sum / samples.len() as f64, max)
}

/// Parses utime+stime out of a `/proc/<pid>/stat` line.
fn parse_stat_ticks(stat: &str) -> Option<u64> {
    // comm may contain spaces and parentheses; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields = rest.split_whitespace().collect::<Vec<_>>();
    let utime = fields.get(11)?.parse::<u64>().ok()?;
    let stime = fields.get(12)?.parse::<u64>().ok()?;
    Some(utime + stime)
}

fn parse_status_rss_kib(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|kib| kib.parse().ok())
}

#[cfg(target_os = "linux")]
fn read_proc_sample(pid: u32) -> Option<ProcSample> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    Some(ProcSample {
        cpu_ticks: parse_stat_ticks(&stat)?,
        rss_kib: parse_status_rss_kib(&status)?,
    })
}

#[cfg(not(target_os = "linux"))]
fn read_proc_sample(_pid: u32) -> Option<ProcSample> {
    None
}
