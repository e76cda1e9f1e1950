use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::policy::TRIAL_LIMIT;
use crate::services::llm::LlmConfig;

const CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_data")]
    pub data_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_trial_limit")]
    pub trial_limit: usize,

    pub llm: LlmConfig,

    #[serde(default)]
    pub account: AccountConfig,
}

/// Identity and billing settings for the terminal front end.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AccountConfig {
    pub user_id: Option<String>,
    #[serde(default)]
    pub subscribed_users: Vec<String>,
    #[serde(default = "default_checkout_url")]
    pub checkout_url: String,
}

fn default_data() -> String {
    "data".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_trial_limit() -> usize {
    TRIAL_LIMIT
}
fn default_checkout_url() -> String {
    "https://example.com/checkout".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(CONFIG_PATH, content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.data_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() -> Result<()> {
        let config = Config::parse(
            r#"
llm:
  provider: ollama
  ollama:
    base_url: http://localhost:11434
    model: llama3
"#,
        )?;
        assert_eq!(config.data_folder, "data");
        assert_eq!(config.output_folder, "output");
        assert_eq!(config.trial_limit, 1);
        assert!(config.account.user_id.is_none());
        assert!(config.account.subscribed_users.is_empty());
        assert_eq!(config.llm.provider, "ollama");
        assert!(config.llm.gemini.is_none());
        Ok(())
    }

    #[test]
    fn test_full_config() -> Result<()> {
        let config = Config::parse(
            r#"
data_folder: /tmp/novels
trial_limit: 5
llm:
  provider: gemini
  gemini:
    api_key: secret
account:
  user_id: reader-1
  subscribed_users: [reader-1]
"#,
        )?;
        assert_eq!(config.trial_limit, 5);
        let gemini = config.llm.gemini.as_ref().unwrap();
        assert_eq!(gemini.api_key, "secret");
        assert_eq!(gemini.model, "gemini-2.5-pro");
        assert_eq!(config.account.user_id.as_deref(), Some("reader-1"));
        assert_eq!(config.account.subscribed_users, vec!["reader-1".to_string()]);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(dir.path().join("config.yml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
