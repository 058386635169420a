// SPDX-License-Identifier: PMPL-1.0-or-later

//! Serialization helpers for printed/exported results

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResultFormat {
    Json,
    Yaml,
}

impl ResultFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Some(ResultFormat::Json),
            "yaml" | "yml" => Some(ResultFormat::Yaml),
            _ => None,
        }
    }

    /// Format implied by a file extension, if any
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::parse)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ResultFormat::Json => "json",
            ResultFormat::Yaml => "yaml",
        }
    }

    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<String> {
        match self {
            ResultFormat::Json => Ok(serde_json::to_string_pretty(value)?),
            ResultFormat::Yaml => Ok(serde_yaml::to_string(value)?),
        }
    }

    pub fn write<T: Serialize>(&self, value: &T, path: &Path) -> Result<()> {
        let data = self.serialize(value)?;
        fs::write(path, data).with_context(|| format!("writing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_and_extension() {
        assert_eq!(ResultFormat::parse("YML"), Some(ResultFormat::Yaml));
        assert_eq!(ResultFormat::parse("ncl"), None);
        assert_eq!(
            ResultFormat::from_path(&PathBuf::from("out/report.json")),
            Some(ResultFormat::Json)
        );
        assert_eq!(ResultFormat::Yaml.extension(), "yaml");
    }

    #[test]
    fn test_write_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.yaml");
        ResultFormat::Yaml
            .write(&crate::exec::EvalStats::default(), &path)
            .unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("strata_evaluated: 0"));
    }
}
