//! Process self-inspection used by the health snapshot and the memory watch.

use std::fs;

use serde::Serialize;

const PROC_STATUS: &str = "/proc/self/status";

/// Process memory, in kilobytes. Fields are `None` where the platform does not expose them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
  pub available: bool,
  pub rss_kb: Option<u64>,
  pub vm_size_kb: Option<u64>,
  pub vm_peak_kb: Option<u64>,
}

impl MemoryStats {
  pub fn rss_mb(&self) -> Option<u64> {
    self.rss_kb.map(|kb| kb / 1024)
  }
}

/// Samples the current process's memory.
pub fn memory_stats() -> MemoryStats {
  fs::read_to_string(PROC_STATUS)
    .map(|status| parse_status(&status))
    .unwrap_or_default()
}

fn parse_status(status: &str) -> MemoryStats {
  let mut stats = MemoryStats::default();
  for line in status.lines() {
    if line.starts_with("VmRSS:") {
      stats.rss_kb = parse_kb_field(line);
    } else if line.starts_with("VmSize:") {
      stats.vm_size_kb = parse_kb_field(line);
    } else if line.starts_with("VmPeak:") {
      stats.vm_peak_kb = parse_kb_field(line);
    }
  }
  stats.available = stats.rss_kb.is_some() || stats.vm_size_kb.is_some() || stats.vm_peak_kb.is_some();
  stats
}

fn parse_kb_field(line: &str) -> Option<u64> {
  line.split_whitespace().nth(1)?.parse().ok()
}
