pub mod procfs;
pub mod recorder;

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("источник метрик '{source_name}' недоступен: {reason}")]
    SourceUnavailable { source_name: String, reason: String },
}

impl SampleError {
    pub fn unavailable(source_name: &str, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn source_name(&self) -> &str {
        match self {
            Self::SourceUnavailable { source_name, .. } => source_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub id: u64,
    pub timestamp: i64,
    pub cpu: f64,
    pub memory: f64,
    pub disk: BTreeMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct Sampler {
    proc_root: PathBuf,
    cpu_window: Duration,
    disk_paths: Vec<String>,
}

impl Sampler {
    pub fn new(proc_root: impl Into<PathBuf>, cpu_window: Duration, disk_paths: Vec<String>) -> Self {
        Self {
            proc_root: proc_root.into(),
            cpu_window,
            disk_paths,
        }
    }

    pub fn disk_paths(&self) -> &[String] {
        &self.disk_paths
    }

    pub async fn sample_cpu(&self) -> Result<f64, SampleError> {
        let first = self.read_cpu_times().await?;
        tokio::time::sleep(self.cpu_window).await;
        let second = self.read_cpu_times().await?;
        Ok(procfs::cpu_usage_between(&first, &second))
    }

    pub async fn sample_memory(&self) -> Result<f64, SampleError> {
        let text = self.read_proc("meminfo", "memory").await?;
        let info = procfs::parse_meminfo(&text)?;
        procfs::memory_usage_percent(&info)
    }

    pub async fn sample_disk(&self) -> Result<BTreeMap<String, f64>, SampleError> {
        let mut out = BTreeMap::new();
        for path in &self.disk_paths {
            let usage = procfs::disk_usage_percent(Path::new(path))?;
            out.insert(path.clone(), usage);
        }
        Ok(out)
    }

    pub async fn sample_disk_partial(&self) -> (BTreeMap<String, f64>, Vec<SampleError>) {
        let mut out = BTreeMap::new();
        let mut errors = Vec::new();
        for path in &self.disk_paths {
            match procfs::disk_usage_percent(Path::new(path)) {
                Ok(usage) => {
                    out.insert(path.clone(), usage);
                }
                Err(err) => errors.push(err),
            }
        }
        (out, errors)
    }

    async fn read_cpu_times(&self) -> Result<procfs::CpuTimes, SampleError> {
        let text = self.read_proc("stat", "cpu").await?;
        procfs::parse_cpu_times(&text)
    }

    async fn read_proc(&self, file: &str, source_name: &str) -> Result<String, SampleError> {
        let path = self.proc_root.join(file);
        tokio::fs::read_to_string(&path).await.map_err(|err| {
            SampleError::unavailable(source_name, format!("{}: {err}", path.display()))
        })
    }
}
