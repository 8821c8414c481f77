use super::SampleError;
#[cfg(unix)]
use std::ffi::CString;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_all(&self) -> u64 {
        self.idle + self.iowait
    }
}

pub fn parse_cpu_times(stat: &str) -> Result<CpuTimes, SampleError> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| SampleError::unavailable("cpu", "в /proc/stat нет строки 'cpu '"))?;

    let fields: Vec<&str> = line.split_whitespace().skip(1).collect();
    if fields.len() < 7 {
        return Err(SampleError::unavailable(
            "cpu",
            format!("ожидалось не меньше 7 счетчиков, получено {}", fields.len()),
        ));
    }

    let field = |idx: usize| -> Result<u64, SampleError> {
        match fields.get(idx) {
            Some(raw) => raw.parse::<u64>().map_err(|err| {
                SampleError::unavailable("cpu", format!("счетчик #{idx} '{raw}': {err}"))
            }),
            None => Ok(0),
        }
    };

    Ok(CpuTimes {
        user: field(0)?,
        nice: field(1)?,
        system: field(2)?,
        idle: field(3)?,
        iowait: field(4)?,
        irq: field(5)?,
        softirq: field(6)?,
        steal: field(7)?,
    })
}

pub fn cpu_usage_between(prev: &CpuTimes, next: &CpuTimes) -> f64 {
    let total_delta = next.total().saturating_sub(prev.total());
    if total_delta == 0 {
        return 0.0;
    }
    let idle_delta = next.idle_all().saturating_sub(prev.idle_all());
    let usage = (1.0 - idle_delta as f64 / total_delta as f64) * 100.0;
    usage.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_kib: u64,
    pub available_kib: u64,
}

pub fn parse_meminfo(text: &str) -> Result<MemInfo, SampleError> {
    let mut total = None;
    let mut available = None;
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next();
        let value = parts.next().and_then(|v| v.parse::<u64>().ok());
        match key {
            Some("MemTotal:") => total = value,
            Some("MemAvailable:") => available = value,
            _ => {}
        }
    }

    let total_kib = total
        .ok_or_else(|| SampleError::unavailable("memory", "в /proc/meminfo нет MemTotal"))?;
    let available_kib = available
        .ok_or_else(|| SampleError::unavailable("memory", "в /proc/meminfo нет MemAvailable"))?;
    Ok(MemInfo {
        total_kib,
        available_kib,
    })
}

pub fn memory_usage_percent(info: &MemInfo) -> Result<f64, SampleError> {
    if info.total_kib == 0 {
        return Err(SampleError::unavailable("memory", "MemTotal равен нулю"));
    }
    let used = info.total_kib.saturating_sub(info.available_kib);
    Ok(used as f64 / info.total_kib as f64 * 100.0)
}

pub fn usage_from_blocks(path: &str, total_blocks: u64, free_blocks: u64) -> Result<f64, SampleError> {
    if total_blocks == 0 {
        return Err(SampleError::unavailable(
            "disk",
            format!("у '{path}' нулевое число блоков"),
        ));
    }
    let used = total_blocks.saturating_sub(free_blocks);
    Ok(used as f64 / total_blocks as f64 * 100.0)
}

#[cfg(unix)]
pub fn disk_usage_percent(path: &Path) -> Result<f64, SampleError> {
    let display = path.display().to_string();
    let c_path = CString::new(display.as_bytes())
        .map_err(|err| SampleError::unavailable("disk", format!("путь '{display}': {err}")))?;

    // SAFETY: statvfs only writes into the zeroed struct we own, and the path is NUL-terminated.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(SampleError::unavailable(
            "disk",
            format!("statvfs '{display}': {err}"),
        ));
    }

    usage_from_blocks(&display, stat.f_blocks as u64, stat.f_bfree as u64)
}

#[cfg(not(unix))]
pub fn disk_usage_percent(path: &Path) -> Result<f64, SampleError> {
    Err(SampleError::unavailable(
        "disk",
        format!("statvfs недоступен для '{}'", path.display()),
    ))
}
