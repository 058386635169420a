// SPDX-License-Identifier: PMPL-1.0-or-later

//! Evaluation budgets and parallelism settings
//!
//! Configuration is optional: every field has a default, a YAML or JSON
//! file may override any subset, and `QLEVAL_*` environment variables take
//! precedence over both.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

const THREADS_ENV: &str = "QLEVAL_THREADS";
const MAX_ROUNDS_ENV: &str = "QLEVAL_MAX_ROUNDS";
const MAX_TUPLES_ENV: &str = "QLEVAL_MAX_TUPLES";
const TIMEOUT_ENV: &str = "QLEVAL_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Worker threads; 1 evaluates everything on the calling thread
    pub threads: usize,
    /// Fixpoint rounds allowed per stratum
    pub max_rounds: usize,
    /// Largest relation or intermediate binding table allowed
    pub max_tuples: usize,
    /// Wall-clock budget per query, in milliseconds
    pub timeout_ms: Option<u64>,
    /// Driving-side size above which a join probe is partitioned across workers
    pub parallel_join_threshold: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            max_rounds: 100_000,
            max_tuples: 50_000_000,
            timeout_ms: None,
            parallel_join_threshold: 8_192,
        }
    }
}

impl EvalConfig {
    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let config = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&data)
                .with_context(|| format!("parsing config {}", path.display()))?,
            "json" => serde_json::from_str(&data)
                .with_context(|| format!("parsing config {}", path.display()))?,
            other => return Err(anyhow!("unsupported config format `{}`", other)),
        };
        Ok(config)
    }

    /// Apply `QLEVAL_*` overrides from the process environment
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(THREADS_ENV) {
            self.threads = parse_env(THREADS_ENV, &value)?;
        }
        if let Some(value) = lookup(MAX_ROUNDS_ENV) {
            self.max_rounds = parse_env(MAX_ROUNDS_ENV, &value)?;
        }
        if let Some(value) = lookup(MAX_TUPLES_ENV) {
            self.max_tuples = parse_env(MAX_TUPLES_ENV, &value)?;
        }
        if let Some(value) = lookup(TIMEOUT_ENV) {
            self.timeout_ms = Some(parse_env(TIMEOUT_ENV, &value)?);
        }
        Ok(self)
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_max_tuples(mut self, tuples: usize) -> Self {
        self.max_tuples = tuples;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_parallel_join_threshold(mut self, threshold: usize) -> Self {
        self.parallel_join_threshold = threshold;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be a non-negative integer, got `{}`", key, value))
}
