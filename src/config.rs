use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::concurrency::Concurrency;

/// Longest delay a job may ask for (v0.1 safety bound).
pub const MAX_DELAY_MS: u64 = 60_000;

/// A batch of simulated jobs plus the bound to run them under.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobFile {
    pub version: String,

    pub concurrency: Concurrency,

    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub id: String,

    /// How long the job stays in flight once started.
    #[serde(default)]
    pub delay_ms: u64,

    /// Success value; defaults to the job id.
    #[serde(default)]
    pub value: Option<String>,

    /// Settle with this error message instead of a value.
    #[serde(default)]
    pub fail: Option<String>,

    /// Panic as soon as the job is started, before it yields a future.
    #[serde(default)]
    pub panic: bool,
}

/// What a job is expected to do, derived from its spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobBehavior {
    Succeed,
    Fail,
    Panic,
}

impl JobSpec {
    pub fn behavior(&self) -> JobBehavior {
        if self.panic {
            JobBehavior::Panic
        } else if self.fail.is_some() {
            JobBehavior::Fail
        } else {
            JobBehavior::Succeed
        }
    }

    pub fn success_value(&self) -> String {
        self.value.clone().unwrap_or_else(|| self.id.clone())
    }
}

impl JobFile {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path: PathBuf = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("resolve current_dir")?
                .join(path)
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read job file '{}'", path.display()))?;
        let file = Self::from_yaml_str(&text)
            .with_context(|| format!("failed to parse job file '{}'", path.display()))?;
        Ok(file)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: JobFile = serde_yaml::from_str(text).context("parse job yaml")?;
        file.validate().context("validate job file")?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(anyhow!("version must not be empty"));
        }
        if self.jobs.is_empty() {
            return Err(anyhow!("job file defines no jobs"));
        }

        let mut seen = HashSet::new();
        for (idx, job) in self.jobs.iter().enumerate() {
            if job.id.trim().is_empty() {
                return Err(anyhow!("job #{idx} has an empty id"));
            }
            if !seen.insert(job.id.as_str()) {
                return Err(anyhow!("duplicate job id '{}'", job.id));
            }
            if job.panic && job.fail.is_some() {
                return Err(anyhow!(
                    "job '{}' sets both panic and fail; pick one",
                    job.id
                ));
            }
            if job.delay_ms > MAX_DELAY_MS {
                return Err(anyhow!(
                    "job '{}' delay is too large ({} ms > {} ms)",
                    job.id,
                    job.delay_ms,
                    MAX_DELAY_MS
                ));
            }
        }
        Ok(())
    }
}
