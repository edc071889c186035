//! Hardware inventory behind the `mem`, `cpu` and `disk info request`
//! directives.

use std::io;
use std::path::Path;

use keel_protocol::{CpuInfo, DiskInfo, MemInfo};

/// Answers hardware-info requests. Errors are reported to the client as
/// `error <msg>` replies.
pub trait HardwareInfo: Send + Sync {
    fn mem_info(&self) -> io::Result<MemInfo>;
    fn cpu_info(&self) -> io::Result<CpuInfo>;
    fn disk_info(&self, dir: &Path) -> io::Result<DiskInfo>;
}

/// Reads the host: `/proc/meminfo` for memory, the scheduler's view of
/// available parallelism for CPUs, and filesystem stats for disks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHardware;

const MEMINFO_PATH: &str = "/proc/meminfo";

impl HardwareInfo for SystemHardware {
    fn mem_info(&self) -> io::Result<MemInfo> {
        let text = std::fs::read_to_string(MEMINFO_PATH)?;
        parse_meminfo(&text).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unrecognized /proc/meminfo")
        })
    }

    fn cpu_info(&self) -> io::Result<CpuInfo> {
        let count = std::thread::available_parallelism()?;
        Ok(CpuInfo {
            cpu_count: count.get() as u64,
        })
    }

    fn disk_info(&self, dir: &Path) -> io::Result<DiskInfo> {
        Ok(DiskInfo {
            total_bytes: fs2::total_space(dir)?,
            available_bytes: fs2::available_space(dir)?,
        })
    }
}

/// Pulls total and available memory (in kB) out of `/proc/meminfo`
/// text. Kernels without `MemAvailable` report `MemFree` instead.
pub fn parse_meminfo(text: &str) -> Option<MemInfo> {
    let mut total = None;
    let mut available = None;
    let mut free = None;
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let value = rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok();
        match key {
            "MemTotal" => total = value,
            "MemAvailable" => available = value,
            "MemFree" => free = value,
            _ => {}
        }
    }
    Some(MemInfo {
        total_kb: total?,
        free_kb: available.or(free)?,
    })
}
