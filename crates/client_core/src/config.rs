use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "crm.toml";
pub const DEFAULT_JOURNAL_URL: &str = "sqlite://./data/crm_journal.db";

/// Client settings: defaults, then an optional TOML file, then `CRM__*`
/// environment variables (`CRM__API_BASE_URL`, `CRM__INVOICE_DUE_DAYS`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub api_base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    /// SQLite url for the saga journal. Set it blank to keep runs in memory.
    #[serde(default)]
    pub journal_database_url: Option<String>,
    pub invoice_due_days: i64,
    pub request_timeout_secs: u64,
    pub send_invoice_on_accept: bool,
}

impl ClientConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Self::builder()?
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("CRM")
                    .prefix_separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// `None` when the journal should live in memory only.
    pub fn journal_url(&self) -> Option<&str> {
        self.journal_database_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("api_base_url", "http://127.0.0.1:8443")?
            .set_default("journal_database_url", DEFAULT_JOURNAL_URL)?
            .set_default("invoice_due_days", 14)?
            .set_default("request_timeout_secs", 30)?
            .set_default("send_invoice_on_accept", false)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        env, fs,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn defaults_apply_without_a_file() {
        let cfg = ClientConfig::builder()
            .expect("defaults")
            .build()
            .expect("build")
            .try_deserialize::<ClientConfig>()
            .expect("config");
        assert_eq!(cfg.invoice_due_days, 14);
        assert_eq!(cfg.request_timeout_secs, 30);
        assert!(!cfg.send_invoice_on_accept);
        assert!(cfg.api_token.is_none());
        assert_eq!(cfg.journal_url(), Some(DEFAULT_JOURNAL_URL));
    }

    #[test]
    fn file_values_override_defaults() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("crm_client_config_{suffix}.toml"));
        fs::write(
            &path,
            r#"
api_base_url = "https://crm.example.test"
api_token = "abc"
invoice_due_days = 30
send_invoice_on_accept = true
journal_database_url = "  "
"#,
        )
        .expect("write config");

        let cfg = ClientConfig::load(Some(&path)).expect("config");
        assert_eq!(cfg.api_base_url, "https://crm.example.test");
        assert_eq!(cfg.api_token.as_deref(), Some("abc"));
        assert_eq!(cfg.invoice_due_days, 30);
        assert_eq!(cfg.request_timeout_secs, 30);
        assert!(cfg.send_invoice_on_accept);
        assert_eq!(cfg.journal_url(), None);

        fs::remove_file(path).expect("cleanup");
    }
}
