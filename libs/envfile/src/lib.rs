//! Proof-task environment file.
//!
//! The provider repo directory carries a dotenv-style `fil-c2.env` that
//! describes the local accelerator and the proof parameter cache. Its
//! entries are also injected into every proof workload.
//!
//! # Format
//!
//! ```text
//! # comment
//! FIL_PROOFS_PARAMETER_CACHE=/var/tmp/filecoin-proof-parameters
//! export RUST_GPU_TOOLS_CUSTOM_GPU="NVIDIA GeForce RTX 3090:10496"
//! ```
//!
//! Keys must match `[A-Za-z_][A-Za-z0-9_]*`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

/// File name of the proof environment file inside the provider repo.
pub const ENV_FILE_NAME: &str = "fil-c2.env";

/// Accelerator descriptor, `<product>:<cores>`.
pub const GPU_DESCRIPTOR_KEY: &str = "RUST_GPU_TOOLS_CUSTOM_GPU";

/// Host path holding the proof parameters.
pub const PARAMETER_CACHE_KEY: &str = "FIL_PROOFS_PARAMETER_CACHE";

/// Set on CPU-only workloads.
pub const NO_GPU_KEY: &str = "BELLMAN_NO_GPU";

#[derive(Debug, Error)]
pub enum EnvFileError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("parse error at line {line}: {reason}")]
    ParseError { line: usize, reason: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed environment file, keys in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    vars: BTreeMap<String, String>,
}

impl EnvFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> Result<Self, EnvFileError> {
        let mut env = Self::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            parse_line(idx + 1, line, &mut env)?;
        }
        Ok(env)
    }

    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self, EnvFileError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Read `fil-c2.env` from the provider repo directory.
    pub fn read_from_repo<P: AsRef<Path>>(repo: P) -> Result<Self, EnvFileError> {
        Self::read_from_file(repo.as_ref().join(ENV_FILE_NAME))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<Option<String>, EnvFileError> {
        let key = key.into();
        validate_key(&key)?;
        Ok(self.vars.insert(key, value.into()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Accelerator product name used for placement matching, or empty when
    /// the host has no accelerator configured.
    pub fn accelerator_descriptor(&self) -> String {
        convert_gpu_name(self.get(GPU_DESCRIPTOR_KEY).unwrap_or_default())
    }

    pub fn parameter_cache(&self) -> Option<&str> {
        self.get(PARAMETER_CACHE_KEY).filter(|v| !v.is_empty())
    }

    /// Variables to inject into a proof workload.
    ///
    /// The parameter cache path is mounted, not passed through. CPU workloads
    /// lose the accelerator descriptor and get `BELLMAN_NO_GPU=1`.
    pub fn workload_env(&self, accelerated: bool) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .iter()
            .filter(|(k, _)| *k != PARAMETER_CACHE_KEY)
            .filter(|(k, _)| accelerated || *k != GPU_DESCRIPTOR_KEY)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if !accelerated {
            out.retain(|(k, _)| k != NO_GPU_KEY);
            out.push((NO_GPU_KEY.to_string(), "1".to_string()));
        }
        out
    }
}

/// Turn a raw GPU descriptor such as `"NVIDIA GeForce RTX 3090:10496"` into
/// the product name advertised on cluster nodes (`"NVIDIA 3090"`).
pub fn convert_gpu_name(raw: &str) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }
    let name = raw.split(':').next().unwrap_or_default();

    if name.contains("NVIDIA") {
        if name.contains("Tesla") {
            return name.replacen("Tesla ", "", 1);
        }
        let name = name.replacen("GeForce ", "", 1);
        return name.replacen("RTX ", "", 1);
    }
    if name.contains("GeForce") {
        return name.replacen("GeForce ", "NVIDIA", 1).replacen("RTX", "", 1);
    }
    name.to_string()
}

fn validate_key(key: &str) -> Result<(), EnvFileError> {
    let invalid = |reason: String| EnvFileError::InvalidKey {
        key: key.to_string(),
        reason,
    };

    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return Err(invalid("key cannot be empty".to_string()));
    };
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(invalid("key must start with a letter or underscore".to_string()));
    }
    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(invalid(format!("invalid character '{c}' in key")));
    }
    Ok(())
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn parse_line(line_num: usize, line: &str, env: &mut EnvFile) -> Result<(), EnvFileError> {
    let line = line.strip_prefix("export ").unwrap_or(line);
    let Some((key, value)) = line.split_once('=') else {
        return Err(EnvFileError::ParseError {
            line: line_num,
            reason: "expected KEY=value format".to_string(),
        });
    };

    env.set(key.trim(), unquote(value))
        .map_err(|e| EnvFileError::ParseError {
            line: line_num,
            reason: e.to_string(),
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SAMPLE: &str = r#"
# proof environment
FIL_PROOFS_PARAMETER_CACHE=/var/tmp/filecoin-proof-parameters
export RUST_GPU_TOOLS_CUSTOM_GPU="NVIDIA GeForce RTX 3090:10496"
RUST_LOG=info
"#;

    #[test]
    fn test_parse_sample() {
        let env = EnvFile::parse(SAMPLE).unwrap();
        assert_eq!(env.len(), 3);
        assert_eq!(env.parameter_cache(), Some("/var/tmp/filecoin-proof-parameters"));
        assert_eq!(env.get(GPU_DESCRIPTOR_KEY), Some("NVIDIA GeForce RTX 3090:10496"));
        assert_eq!(env.accelerator_descriptor(), "NVIDIA 3090");
    }

    #[test]
    fn test_parse_reports_line_numbers() {
        let err = EnvFile::parse("A=1\nnot a pair\n").unwrap_err();
        assert!(matches!(err, EnvFileError::ParseError { line: 2, .. }));

        let err = EnvFile::parse("\n\n1BAD=x").unwrap_err();
        assert!(matches!(err, EnvFileError::ParseError { line: 3, .. }));
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("FOO_1").is_ok());
        assert!(validate_key("_x").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("9x").is_err());
        assert!(validate_key("a-b").is_err());
    }

    #[rstest]
    #[case("", "")]
    #[case("   ", "")]
    #[case("NVIDIA GeForce RTX 3090:10496", "NVIDIA 3090")]
    #[case("NVIDIA Tesla V100:5120", "NVIDIA V100")]
    #[case("NVIDIA A100", "NVIDIA A100")]
    #[case("GeForce RTX 4090", "NVIDIA 4090")]
    #[case("AMD Radeon", "AMD Radeon")]
    fn test_convert_gpu_name(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(convert_gpu_name(raw), expected);
    }

    #[test]
    fn test_workload_env_for_gpu() {
        let env = EnvFile::parse(SAMPLE).unwrap();
        let vars = env.workload_env(true);
        assert!(vars.iter().all(|(k, _)| k != PARAMETER_CACHE_KEY));
        assert!(vars.iter().any(|(k, _)| k == GPU_DESCRIPTOR_KEY));
        assert!(vars.iter().all(|(k, _)| k != NO_GPU_KEY));
    }

    #[test]
    fn test_workload_env_for_cpu() {
        let env = EnvFile::parse(SAMPLE).unwrap();
        let vars = env.workload_env(false);
        assert!(vars.iter().all(|(k, _)| k != GPU_DESCRIPTOR_KEY && k != PARAMETER_CACHE_KEY));
        assert!(vars.contains(&(NO_GPU_KEY.to_string(), "1".to_string())));
        assert!(vars.contains(&("RUST_LOG".to_string(), "info".to_string())));
    }

    #[test]
    fn test_read_from_repo() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ENV_FILE_NAME), SAMPLE).unwrap();
        let env = EnvFile::read_from_repo(dir.path()).unwrap();
        assert_eq!(env.len(), 3);

        let missing = EnvFile::read_from_repo(dir.path().join("nope"));
        assert!(matches!(missing, Err(EnvFileError::Io(_))));
    }
}
