//! Minimal `/proc` readers for process and host resource usage

use std::fs;
use std::io;
use std::sync::OnceLock;

use nix::unistd::{SysconfVar, sysconf};

/// Fields of `/proc/<pid>/stat` the monitors care about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub state: char,
    pub pgrp: i32,
    pub utime: u64,
    pub stime: u64,
    pub rss_pages: u64,
}

impl ProcStat {
    /// Zombie or dead: the process no longer runs
    pub fn is_exited(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }

    pub fn cpu_ticks(&self) -> u64 {
        self.utime + self.stime
    }
}

/// Parse one `/proc/<pid>/stat` line.
///
/// The command name may contain spaces and parentheses, so fields are
/// taken after the last `)`.
pub fn parse_stat(content: &str) -> Option<ProcStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid = content[..open].trim().parse().ok()?;
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
    if fields.len() < 22 {
        return None;
    }
    Some(ProcStat {
        pid,
        state: fields[0].chars().next()?,
        pgrp: fields[2].parse().ok()?,
        utime: fields[11].parse().ok()?,
        stime: fields[12].parse().ok()?,
        rss_pages: fields[21].parse::<i64>().ok()?.max(0) as u64,
    })
}

pub fn read_stat(pid: i32) -> Option<ProcStat> {
    let content = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(&content)
}

/// Aggregate usage of the live members of one process group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupUsage {
    pub members: usize,
    pub rss_bytes: u64,
    pub cpu_ticks: u64,
}

/// Sum usage over every non-zombie process whose group is `pgid`
pub fn group_usage(pgid: i32) -> io::Result<GroupUsage> {
    let mut usage = GroupUsage::default();
    for entry in fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        // Processes can vanish between listing and reading
        let Some(stat) = read_stat(pid) else { continue };
        if stat.pgrp != pgid || stat.is_exited() {
            continue;
        }
        usage.members += 1;
        usage.rss_bytes += stat.rss_pages * page_size();
        usage.cpu_ticks += stat.cpu_ticks();
    }
    Ok(usage)
}

pub fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|v| v as u64)
            .unwrap_or(4096)
    })
}

pub fn clock_ticks() -> u64 {
    static CLK_TCK: OnceLock<u64> = OnceLock::new();
    *CLK_TCK.get_or_init(|| {
        sysconf(SysconfVar::CLK_TCK)
            .ok()
            .flatten()
            .map(|v| v as u64)
            .unwrap_or(100)
    })
}

/// Aggregate CPU counters from the first line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

impl CpuTimes {
    /// Busy percentage between two readings
    pub fn busy_percent_since(&self, earlier: &CpuTimes) -> f64 {
        let total = self.total.saturating_sub(earlier.total);
        if total == 0 {
            return 0.0;
        }
        let idle = self.idle.saturating_sub(earlier.idle);
        (total.saturating_sub(idle) as f64 / total as f64) * 100.0
    }
}

pub fn parse_cpu_times(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|line| line.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: values.iter().sum(),
    })
}

pub fn read_cpu_times() -> io::Result<CpuTimes> {
    let content = fs::read_to_string("/proc/stat")?;
    parse_cpu_times(&content)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc/stat"))
}

/// Host memory figures from `/proc/meminfo`, in kilobytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemInfo {
    pub fn used_percent(&self) -> f64 {
        if self.total_kb == 0 {
            return 0.0;
        }
        let used = self.total_kb.saturating_sub(self.available_kb);
        used as f64 / self.total_kb as f64 * 100.0
    }
}

pub fn parse_meminfo(content: &str) -> Option<MemInfo> {
    let mut total = None;
    let mut available = None;
    let mut free = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.parse::<u64>().ok();
        match key {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = value,
            "MemFree:" => free = value,
            _ => {}
        }
    }
    Some(MemInfo {
        total_kb: total?,
        // Kernels before 3.14 lack MemAvailable
        available_kb: available.or(free)?,
    })
}

pub fn read_meminfo() -> io::Result<MemInfo> {
    let content = fs::read_to_string("/proc/meminfo")?;
    parse_meminfo(&content)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc/meminfo"))
}
