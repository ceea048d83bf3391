//! Configuration loading: TOML file, `~` expansion and environment overrides.

pub mod schema;

pub use schema::{
    AnalysisConfig, AnalyzerConfig, ChunkPolicy, Config, LoggingConfig, QueueConfig, ScanConfig,
    ServerConfig, StorageConfig, UploadsConfig,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// `<config dir>/wpaudit/config.toml`, or `./config.toml` when no home is known.
pub fn default_config_path() -> PathBuf {
    ProjectDirs::from("", "", "wpaudit")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

impl Config {
    /// Load from `path` (or the default location). A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::from_toml(&raw).with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Overlay the `WPAUDIT_*` variables; `lookup` is injectable for tests.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty("WPAUDIT_API_KEY") {
            self.server.api_key = Some(key);
        }
        if let Some(key) = non_empty("WPAUDIT_ANALYZER_API_KEY").or_else(|| non_empty("OPENAI_API_KEY")) {
            self.analyzer.api_key = Some(key);
        }
        if let Some(model) = non_empty("WPAUDIT_ANALYZER_MODEL") {
            self.analyzer.model = model;
        }
        if let Some(bind) = non_empty("WPAUDIT_BIND") {
            self.server.bind = bind;
        }
    }

    pub fn base_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage.base_dir).to_string())
    }

    pub fn database_path(&self) -> PathBuf {
        let db = PathBuf::from(shellexpand::tilde(&self.storage.database).to_string());
        if db.is_absolute() {
            db
        } else {
            self.base_dir().join(db)
        }
    }

    /// Effective config as TOML with secrets replaced.
    pub fn to_masked_toml(&self) -> Result<String> {
        let mut masked = self.clone();
        let mask = |v: &mut Option<String>| {
            if v.is_some() {
                *v = Some("********".into());
            }
        };
        mask(&mut masked.server.api_key);
        mask(&mut masked.analyzer.api_key);
        Ok(toml::to_string_pretty(&masked)?)
    }

    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.analysis.lines_per_chunk, 100);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.analyzer.chunk_timeout_secs, 180);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config =
            Config::from_toml("[queue]\nworkers = 7\n[analysis]\nchunk_policy = \"tokens\"\n").unwrap();
        assert_eq!(config.queue.workers, 7);
        assert_eq!(config.analysis.chunk_policy, ChunkPolicy::Tokens);
        assert_eq!(config.queue.backoff_secs, 60);
    }

    #[test]
    fn analyzer_key_falls_back_to_openai_variable() {
        let env: HashMap<&str, &str> = [("OPENAI_API_KEY", "sk-test"), ("WPAUDIT_BIND", "0.0.0.0:1")]
            .into_iter()
            .collect();
        let mut config = Config::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.analyzer.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.server.bind, "0.0.0.0:1");
    }

    #[test]
    fn relative_database_resolves_under_base_dir() {
        let mut config = Config::default();
        config.storage.base_dir = "/srv/wp".into();
        assert_eq!(config.database_path(), PathBuf::from("/srv/wp/wpaudit.db"));
    }

    #[test]
    fn masked_output_hides_secrets() {
        let mut config = Config::default();
        config.analyzer.api_key = Some("sk-secret".into());
        let shown = config.to_masked_toml().unwrap();
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("********"));
    }

    #[test]
    fn schema_mentions_sections() {
        let schema = Config::json_schema().unwrap();
        assert!(schema.contains("analyzer"));
    }
}
