use crate::capabilities::{CapabilityProvider, STORAGE, TRANSFORM_TOOL};
use crate::sink::FsObjectStore;
use crate::tool::DbtCli;
use crate::PipelineError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BUCKET: &str = "sites-lake";
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbtConfig {
    pub executable: PathBuf,
    pub project_dir: PathBuf,
    pub profiles_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for DbtConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("dbt"),
            project_dir: PathBuf::from("."),
            profiles_dir: None,
            timeout: Duration::from_secs(600),
        }
    }
}

impl DbtConfig {
    pub fn client(&self) -> DbtCli {
        let client = DbtCli::new(&self.project_dir)
            .with_executable(&self.executable)
            .with_timeout(self.timeout);
        match self.profiles_dir.as_ref() {
            Some(profiles_dir) => client.with_profiles_dir(profiles_dir),
            None => client,
        }
    }
}

/// Process-wide settings, read once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub bucket: String,
    pub storage_root: PathBuf,
    pub state_dir: PathBuf,
    pub scratch_dir: Option<PathBuf>,
    pub max_concurrency: usize,
    pub dbt: DbtConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            storage_root: PathBuf::from(".strata/objects"),
            state_dir: PathBuf::from(".strata/state"),
            scratch_dir: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            dbt: DbtConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let timeout_secs = match get("STRATA_DBT_TIMEOUT_SECS") {
            Some(raw) => parse_positive("STRATA_DBT_TIMEOUT_SECS", &raw)? as u64,
            None => defaults.dbt.timeout.as_secs(),
        };
        let max_concurrency = match get("STRATA_MAX_CONCURRENCY") {
            Some(raw) => parse_positive("STRATA_MAX_CONCURRENCY", &raw)?,
            None => defaults.max_concurrency,
        };

        let project_dir = get("STRATA_DBT_PROJECT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.dbt.project_dir);

        Ok(Self {
            bucket: get("STRATA_BUCKET").unwrap_or(defaults.bucket),
            storage_root: get("STRATA_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            state_dir: get("STRATA_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            scratch_dir: get("STRATA_SCRATCH_DIR").map(PathBuf::from),
            max_concurrency,
            dbt: DbtConfig {
                executable: get("STRATA_DBT_EXECUTABLE")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.dbt.executable),
                project_dir,
                profiles_dir: get("STRATA_DBT_PROFILES_DIR").map(PathBuf::from),
                timeout: Duration::from_secs(timeout_secs),
            },
        })
    }

    /// Handles for one run: the local object store as `storage` and the dbt
    /// client as `transform_tool`.
    pub fn provision_capabilities(&self) -> CapabilityProvider {
        CapabilityProvider::builder()
            .storage(STORAGE, Arc::new(FsObjectStore::new(&self.storage_root)))
            .transform_tool(TRANSFORM_TOOL, Arc::new(self.dbt.client()))
            .build()
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<usize, PipelineError> {
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(PipelineError::Config(format!(
            "{key} must be a positive integer, got '{raw}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: BTreeMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn from_lookup_empty_environment_expected_defaults() {
        let config = PipelineConfig::from_lookup(lookup(&[])).expect("defaults should load");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.bucket, "sites-lake");
        assert_eq!(config.dbt.timeout, Duration::from_secs(600));
    }

    #[test]
    fn from_lookup_overrides_expected_values_applied() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("STRATA_BUCKET", "lake-test"),
            ("STRATA_STORAGE_ROOT", "/data/objects"),
            ("STRATA_DBT_PROJECT_DIR", "/srv/dbt"),
            ("STRATA_DBT_PROFILES_DIR", "/srv/profiles"),
            ("STRATA_DBT_TIMEOUT_SECS", "30"),
            ("STRATA_MAX_CONCURRENCY", "8"),
            ("STRATA_SCRATCH_DIR", "  "),
        ]))
        .expect("overrides should load");

        assert_eq!(config.bucket, "lake-test");
        assert_eq!(config.storage_root, PathBuf::from("/data/objects"));
        assert_eq!(config.dbt.project_dir, PathBuf::from("/srv/dbt"));
        assert_eq!(config.dbt.profiles_dir, Some(PathBuf::from("/srv/profiles")));
        assert_eq!(config.dbt.timeout, Duration::from_secs(30));
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.scratch_dir, None);
    }

    #[test]
    fn from_lookup_invalid_number_expected_config_error() {
        for raw in ["zero", "0", "-3"] {
            let error = PipelineConfig::from_lookup(lookup(&[("STRATA_MAX_CONCURRENCY", raw)]))
                .expect_err("invalid concurrency should fail");
            assert!(matches!(error, PipelineError::Config(_)));
            assert_eq!(error.kind(), "config");
        }
    }

    #[test]
    fn provision_capabilities_expected_storage_and_exclusive_tool() {
        let provider = PipelineConfig::default().provision_capabilities();
        assert!(!provider.resolve(STORAGE).expect("storage").is_exclusive());
        assert!(provider.resolve(TRANSFORM_TOOL).expect("tool").is_exclusive());
    }
}
