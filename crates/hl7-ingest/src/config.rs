//! Loader configuration
//!
//! Values come from the environment (a `.env` file is honoured), fall back to
//! the `DEFAULT_*` constants below, and may then be overridden by CLI flags.
//!
//! Message headers are excluded unless `HL7_EXCLUDE_SEGMENTS` says otherwise;
//! an empty value loads every segment type, `MSH` included.

use crate::decoder::HEADER_SEGMENT;
use crate::inference::{FieldDictionary, SchemaInferrer};
use crate::orchestrator::{RunOrchestrator, DEFAULT_CONCURRENCY};
use crate::pipeline::{LoadPipeline, DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_ROWS};
use crate::registry::TableRegistry;
use crate::retry::{
    BackoffPolicy, Clock, Retrier, DEFAULT_BASE_DELAY_MS, DEFAULT_JITTER, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY_MS,
};
use crate::store::bigquery::{endpoints::DEFAULT_API_URL, BigQueryStore, DEFAULT_API_TIMEOUT_SECS};
use crate::store::RemoteStore;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Loader Configuration Constants
// ============================================================================

/// Default BigQuery dataset
pub const DEFAULT_DATASET: &str = "hl7_data";

/// Project id used by dry runs when none is configured
pub const DRY_RUN_PROJECT: &str = "dry-run";

/// Default run timeout in seconds (one hour)
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 3600;

/// Loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub bigquery: BigQueryConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub load: LoadConfig,
}

/// Remote store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigQueryConfig {
    pub project_id: Option<String>,
    pub dataset: String,
    pub api_url: String,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    /// File holding a bearer access token
    pub credentials_path: Option<PathBuf>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub max_rows: usize,
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub jitter: f64,
    /// 0 disables the run deadline
    pub run_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    pub concurrency: usize,
    pub field_dictionary: Option<PathBuf>,
    pub exclude_segments: Vec<String>,
    pub infer_types: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl LoaderConfig {
    /// Load configuration from environment and defaults, then validate
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Read configuration from the environment without validating
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let trimmed = |key: &str| lookup(key).map(|v| v.trim().to_string());
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        LoaderConfig {
            bigquery: BigQueryConfig {
                project_id: non_empty("GCP_PROJECT_ID"),
                dataset: non_empty("BIGQUERY_DATASET").unwrap_or_else(|| DEFAULT_DATASET.to_string()),
                api_url: non_empty("BIGQUERY_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
                access_token: non_empty("BIGQUERY_ACCESS_TOKEN"),
                credentials_path: non_empty("BIGQUERY_CREDENTIALS_PATH").map(PathBuf::from),
                timeout_secs: parse_or(trimmed("BIGQUERY_TIMEOUT_SECS"), DEFAULT_API_TIMEOUT_SECS),
            },
            batch: BatchConfig {
                max_rows: parse_or(trimmed("HL7_MAX_BATCH_ROWS"), DEFAULT_MAX_BATCH_ROWS),
                max_bytes: parse_or(trimmed("HL7_MAX_BATCH_BYTES"), DEFAULT_MAX_BATCH_BYTES),
            },
            retry: RetryConfig {
                max_attempts: parse_or(trimmed("HL7_MAX_ATTEMPTS"), DEFAULT_MAX_ATTEMPTS),
                backoff_base_ms: parse_or(trimmed("HL7_BACKOFF_BASE_MS"), DEFAULT_BASE_DELAY_MS),
                backoff_cap_ms: parse_or(trimmed("HL7_BACKOFF_CAP_MS"), DEFAULT_MAX_DELAY_MS),
                jitter: parse_or(trimmed("HL7_BACKOFF_JITTER"), DEFAULT_JITTER),
                run_timeout_secs: parse_or(trimmed("HL7_RUN_TIMEOUT_SECS"), DEFAULT_RUN_TIMEOUT_SECS),
            },
            load: LoadConfig {
                concurrency: parse_or(trimmed("HL7_CONCURRENCY"), DEFAULT_CONCURRENCY),
                field_dictionary: non_empty("HL7_FIELD_DICTIONARY").map(PathBuf::from),
                exclude_segments: lookup("HL7_EXCLUDE_SEGMENTS")
                    .map(|v| split_list(&v))
                    .unwrap_or_else(|| vec![HEADER_SEGMENT.to_string()]),
                infer_types: lookup("HL7_INFER_TYPES")
                    .and_then(|v| parse_flag(&v))
                    .unwrap_or(true),
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bigquery.dataset.is_empty()
            || !self
                .bigquery
                .dataset
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!(
                "Dataset '{}' must contain only letters, digits and underscores",
                self.bigquery.dataset
            );
        }

        if !self.bigquery.api_url.starts_with("http://")
            && !self.bigquery.api_url.starts_with("https://")
        {
            anyhow::bail!("BigQuery API URL must start with http:// or https://");
        }

        if self.batch.max_rows == 0 {
            anyhow::bail!("Max batch rows must be greater than 0");
        }

        if self.batch.max_bytes == 0 {
            anyhow::bail!("Max batch bytes must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("Max attempts must be at least 1");
        }

        if self.retry.backoff_base_ms == 0 {
            anyhow::bail!("Backoff base must be greater than 0");
        }

        if self.retry.backoff_cap_ms < self.retry.backoff_base_ms {
            anyhow::bail!(
                "Backoff cap ({}ms) cannot be below the backoff base ({}ms)",
                self.retry.backoff_cap_ms,
                self.retry.backoff_base_ms
            );
        }

        if !(0.0..1.0).contains(&self.retry.jitter) {
            anyhow::bail!("Backoff jitter must be in [0, 1), got {}", self.retry.jitter);
        }

        if self.load.concurrency == 0 {
            anyhow::bail!("Concurrency must be greater than 0");
        }

        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.backoff_base_ms),
            max_delay: Duration::from_millis(self.retry.backoff_cap_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.retry.run_timeout_secs > 0).then(|| Duration::from_secs(self.retry.run_timeout_secs))
    }

    /// Project id, required for remote runs
    pub fn project_id(&self) -> anyhow::Result<&str> {
        self.bigquery
            .project_id
            .as_deref()
            .context("GCP_PROJECT_ID is not set")
    }

    /// Bearer token from `BIGQUERY_ACCESS_TOKEN` or the credentials file
    pub fn access_token(&self) -> anyhow::Result<String> {
        if let Some(token) = &self.bigquery.access_token {
            return Ok(token.trim().to_string());
        }

        let path = self
            .bigquery
            .credentials_path
            .as_ref()
            .context("Neither BIGQUERY_ACCESS_TOKEN nor BIGQUERY_CREDENTIALS_PATH is set")?;
        let token = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials from {}", path.display()))?;

        let token = token.trim();
        if token.is_empty() {
            anyhow::bail!("Credentials file {} is empty", path.display());
        }
        Ok(token.to_string())
    }

    pub fn inferrer(&self) -> anyhow::Result<SchemaInferrer> {
        let dictionary = match &self.load.field_dictionary {
            Some(path) => FieldDictionary::load(path)
                .with_context(|| format!("Failed to load field dictionary {}", path.display()))?,
            None => FieldDictionary::new(),
        };
        Ok(SchemaInferrer::new(dictionary).with_type_inference(self.load.infer_types))
    }

    pub fn bigquery_store(&self) -> anyhow::Result<BigQueryStore> {
        let token = self.access_token()?;
        Ok(BigQueryStore::new(
            self.bigquery.api_url.as_str(),
            token,
            Duration::from_secs(self.bigquery.timeout_secs),
        )?)
    }

    /// Wire a run orchestrator over `store`
    pub fn build_orchestrator(
        &self,
        store: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        run_id: &str,
    ) -> anyhow::Result<RunOrchestrator> {
        let project = self
            .bigquery
            .project_id
            .clone()
            .unwrap_or_else(|| DRY_RUN_PROJECT.to_string());

        let retrier = Arc::new(Retrier::new(self.backoff_policy()).with_clock(clock));
        let registry = TableRegistry::new(
            store.clone(),
            project,
            self.bigquery.dataset.as_str(),
            retrier.clone(),
        );
        let pipeline = LoadPipeline::new(store, retrier.clone(), run_id)
            .with_limits(self.batch.max_rows, self.batch.max_bytes);

        Ok(
            RunOrchestrator::new(self.inferrer()?, registry, pipeline, retrier)
                .with_excluded_segments(&self.load.exclude_segments)
                .with_concurrency(self.load.concurrency)
                .with_run_timeout(self.run_timeout()),
        )
    }
}

/// Comma or whitespace separated list, uppercased
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn config(vars: &[(&str, &str)]) -> LoaderConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LoaderConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::default();

        assert_eq!(config.bigquery.dataset, "hl7_data");
        assert_eq!(config.bigquery.api_url, DEFAULT_API_URL);
        assert_eq!(config.batch.max_rows, DEFAULT_MAX_BATCH_ROWS);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.load.infer_types);
        assert_eq!(config.load.exclude_segments, vec!["MSH"]);
        assert_eq!(config.run_timeout(), Some(Duration::from_secs(3600)));
        assert!(config.validate().is_ok());
        assert!(config.project_id().is_err());
    }

    #[test]
    fn test_empty_exclusion_loads_headers() {
        let config = config(&[("HL7_EXCLUDE_SEGMENTS", "")]);
        assert!(config.load.exclude_segments.is_empty());
    }

    #[test]
    fn test_environment_overrides() {
        let config = config(&[
            ("GCP_PROJECT_ID", "acme-health"),
            ("BIGQUERY_DATASET", "hl7_staging"),
            ("HL7_MAX_BATCH_ROWS", "50"),
            ("HL7_BACKOFF_JITTER", "0.1"),
            ("HL7_RUN_TIMEOUT_SECS", "0"),
            ("HL7_EXCLUDE_SEGMENTS", "msh, evn"),
            ("HL7_INFER_TYPES", "false"),
            ("HL7_CONCURRENCY", "not-a-number"),
        ]);

        assert_eq!(config.project_id().unwrap(), "acme-health");
        assert_eq!(config.bigquery.dataset, "hl7_staging");
        assert_eq!(config.batch.max_rows, 50);
        assert_eq!(config.retry.jitter, 0.1);
        assert_eq!(config.run_timeout(), None);
        assert_eq!(config.load.exclude_segments, vec!["MSH", "EVN"]);
        assert!(!config.load.infer_types);
        assert_eq!(config.load.concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn test_validation_failures() {
        assert!(config(&[("BIGQUERY_DATASET", "hl7-data")]).validate().is_err());
        assert!(config(&[("HL7_MAX_ATTEMPTS", "0")]).validate().is_err());
        assert!(config(&[("HL7_BACKOFF_JITTER", "1.0")]).validate().is_err());
        assert!(config(&[("HL7_BACKOFF_BASE_MS", "500"), ("HL7_BACKOFF_CAP_MS", "100")])
            .validate()
            .is_err());
        assert!(config(&[("BIGQUERY_API_URL", "localhost:9050")]).validate().is_err());
    }

    #[test]
    fn test_access_token_sources() {
        let config_with_token = config(&[("BIGQUERY_ACCESS_TOKEN", " ya29.token \n")]);
        assert_eq!(config_with_token.access_token().unwrap(), "ya29.token");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ya29.from-file").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let config_with_file = config(&[("BIGQUERY_CREDENTIALS_PATH", path.as_str())]);
        assert_eq!(config_with_file.access_token().unwrap(), "ya29.from-file");

        assert!(LoaderConfig::default().access_token().is_err());
    }

    #[test]
    fn test_backoff_policy_from_config() {
        let policy = config(&[("HL7_MAX_ATTEMPTS", "3"), ("HL7_BACKOFF_BASE_MS", "50")]).backoff_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("MSH,EVN  pv1"), vec!["MSH", "EVN", "PV1"]);
        assert!(split_list(" , ").is_empty());
    }
}
