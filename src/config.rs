//! Configuration parsing and run settings.
//!
//! Configuration is read from a TOML file (default `./config/wikirag.toml`).
//! Every section is optional; a missing section takes the defaults below.
//!
//! ```toml
//! [store]
//! name = "fileSearchStores/wikipedia-knowledge-base-abc123"
//! display_name = "wikipedia-knowledge-base"
//!
//! [corpus]
//! root = "./data/wikipedia"
//! include_globs = ["*.md"]
//! mapping_file = "file_mappings.json"
//!
//! [upload]
//! timeout_secs = 120
//! max_retries = 4
//! max_parallel = 2
//!
//! [generation]
//! model = "models/gemini-2.5-pro"
//! temperature = 0.7
//!
//! [api]
//! api_key_env = "GOOGLE_API_KEY"
//! ```
//!
//! Environment variables (`STORE_NAME`, `GEMINI_MODEL`, `UPLOAD_TIMEOUT_SECS`)
//! override the file, and CLI flags override both. The API key is only ever
//! read from the environment.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use wikirag_core::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Existing store resource name (`fileSearchStores/...`). Unset means
    /// "use the store recorded in the mapping file, or create one".
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_display_name")]
    pub display_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: None,
            display_name: default_display_name(),
        }
    }
}

fn default_display_name() -> String {
    "wikipedia-knowledge-base".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_mapping_file")]
    pub mapping_file: PathBuf,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            mapping_file: default_mapping_file(),
            follow_symlinks: false,
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./data/wikipedia")
}
fn default_include_globs() -> Vec<String> {
    vec!["*.md".to_string()]
}
fn default_mapping_file() -> PathBuf {
    PathBuf::from("file_mappings.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Per-attempt upload timeout, including operation polling.
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_upload_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            max_parallel: default_max_parallel(),
        }
    }
}

fn default_upload_timeout_secs() -> u64 {
    120
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    4
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_secs() -> u64 {
    32
}
fn default_max_parallel() -> usize {
    2
}

impl UploadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(self.backoff_max_secs),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_citations")]
    pub max_citations: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_citations: default_max_citations(),
        }
    }
}

fn default_model() -> String {
    "models/gemini-2.5-pro".to_string()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_citations() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Timeout for ordinary (non-upload) requests.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_api_key_env() -> String {
    "GOOGLE_API_KEY".to_string()
}
fn default_request_timeout_secs() -> u64 {
    60
}

impl Config {
    /// All defaults; used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Apply `STORE_NAME`, `GEMINI_MODEL` and `UPLOAD_TIMEOUT_SECS` from the
    /// process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// [`Config::apply_env`] with an injectable lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(name) = non_empty("STORE_NAME") {
            self.store.name = Some(name.trim().to_string());
        }
        if let Some(model) = non_empty("GEMINI_MODEL") {
            self.generation.model = model.trim().to_string();
        }
        if let Some(secs) = non_empty("UPLOAD_TIMEOUT_SECS") {
            self.upload.timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("UPLOAD_TIMEOUT_SECS is not a number: '{}'", secs))?;
        }
        validate(self)
    }
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.upload.timeout_secs == 0 {
        bail!("upload.timeout_secs must be > 0");
    }
    if config.upload.poll_interval_secs == 0 {
        bail!("upload.poll_interval_secs must be > 0");
    }
    if config.upload.max_parallel == 0 {
        bail!("upload.max_parallel must be >= 1");
    }
    if config.upload.backoff_max_secs.saturating_mul(1000) < config.upload.backoff_base_ms {
        bail!("upload.backoff_max_secs must not be smaller than upload.backoff_base_ms");
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        bail!("generation.temperature must be in [0.0, 2.0]");
    }
    if config.generation.max_citations == 0 {
        bail!("generation.max_citations must be >= 1");
    }
    if config.corpus.include_globs.is_empty() {
        bail!("corpus.include_globs must not be empty");
    }
    if config.api.api_key_env.trim().is_empty() {
        bail!("api.api_key_env must name an environment variable");
    }
    if let Some(name) = &config.store.name {
        if !name.starts_with("fileSearchStores/") {
            bail!(
                "store.name must be a resource name like 'fileSearchStores/<id>', got '{}'",
                name
            );
        }
    }
    Ok(())
}

/// The API key. Never printed.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Read the key from `var`, failing with a hint if it is unset.
    pub fn from_env(var: &str) -> Result<Self> {
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(Self(key.trim().to_string())),
            _ => bail!(
                "{} is not set. Put it in the environment or in a .env file.",
                var
            ),
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Everything one sync run needs, after config, environment and CLI flags
/// have been merged.
#[derive(Debug, Clone)]
pub struct Settings {
    pub credential: Credential,
    pub store_reference: Option<String>,
    pub local_directory: PathBuf,
    pub upload_timeout: Duration,
    pub reset: bool,
    pub max_parallel_uploads: usize,
}

impl Settings {
    pub fn new(config: &Config, credential: Credential, reset: bool) -> Self {
        Self {
            credential,
            store_reference: config.store.name.clone(),
            local_directory: config.corpus.root.clone(),
            upload_timeout: config.upload.timeout(),
            reset,
            max_parallel_uploads: config.upload.max_parallel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.corpus.include_globs, vec!["*.md"]);
        assert_eq!(config.corpus.mapping_file, PathBuf::from("file_mappings.json"));
        assert_eq!(config.upload.timeout_secs, 120);
        assert_eq!(config.upload.max_parallel, 2);
        assert_eq!(config.generation.model, "models/gemini-2.5-pro");
        assert_eq!(config.generation.max_citations, 5);
        assert_eq!(config.api.api_key_env, "GOOGLE_API_KEY");
        assert!(config.store.name.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [upload]
            timeout_secs = 30

            [store]
            name = "fileSearchStores/abc"
            "#,
        )
        .unwrap();
        assert_eq!(config.upload.timeout_secs, 30);
        assert_eq!(config.upload.max_retries, 4);
        assert_eq!(config.store.name.as_deref(), Some("fileSearchStores/abc"));
        assert_eq!(config.store.display_name, "wikipedia-knowledge-base");
    }

    #[test]
    fn load_config_validates() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("wikirag.toml");

        std::fs::write(&path, "[upload]\nmax_parallel = 0\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("max_parallel"));

        std::fs::write(&path, "[store]\nname = \"my-store\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("fileSearchStores/"));

        std::fs::write(&path, "[generation]\ntemperature = 0.2\n").unwrap();
        assert!(load_config(&path).is_ok());
    }

    #[test]
    fn huge_backoff_ceiling_is_accepted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("wikirag.toml");
        std::fs::write(&path, format!("[upload]\nbackoff_max_secs = {}\n", i64::MAX)).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.upload.backoff_max_secs, i64::MAX as u64);
    }

    #[test]
    fn environment_overrides_file() {
        let mut config: Config =
            toml::from_str("[store]\nname = \"fileSearchStores/from-file\"\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("STORE_NAME", "fileSearchStores/from-env"),
            ("GEMINI_MODEL", "models/gemini-2.5-flash"),
            ("UPLOAD_TIMEOUT_SECS", "45"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env_with(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.store.name.as_deref(), Some("fileSearchStores/from-env"));
        assert_eq!(config.generation.model, "models/gemini-2.5-flash");
        assert_eq!(config.upload.timeout_secs, 45);
    }

    #[test]
    fn blank_environment_values_are_ignored() {
        let mut config = Config::minimal();
        config
            .apply_env_with(|k| (k == "STORE_NAME").then(|| "  ".to_string()))
            .unwrap();
        assert!(config.store.name.is_none());
    }

    #[test]
    fn bad_timeout_in_environment_is_an_error() {
        let mut config = Config::minimal();
        let err = config
            .apply_env_with(|k| (k == "UPLOAD_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("UPLOAD_TIMEOUT_SECS"));
    }

    #[test]
    fn credential_is_redacted() {
        let settings = Settings::new(&Config::minimal(), Credential::new("secret-key"), false);
        let debug = format!("{:?}", settings);
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("***"));
        assert_eq!(settings.credential.expose(), "secret-key");
    }

    #[test]
    fn retry_policy_follows_upload_section() {
        let config = Config::minimal();
        let policy = config.upload.retry_policy();
        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(32));
    }
}
