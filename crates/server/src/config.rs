use std::{collections::HashMap, fs};

pub const SETTINGS_FILE: &str = "server.toml";

#[derive(Debug)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    pub require_auth: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/crm.db".into(),
            jwt_secret: "dev-secret-change-me".into(),
            token_ttl_seconds: 12 * 3600,
            require_auth: true,
        }
    }
}

/// Defaults, then `server.toml`, then the environment. Later names in each
/// env list win over earlier ones.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        apply_file_settings(&mut settings, &raw);
    }
    apply_overrides(&mut settings, |key| {
        let names: &[&str] = match key {
            "bind_addr" => &["SERVER_BIND", "APP__BIND_ADDR"],
            "database_url" => &["DATABASE_URL", "APP__DATABASE_URL"],
            "jwt_secret" => &["APP__JWT_SECRET"],
            "token_ttl_seconds" => &["APP__TOKEN_TTL_SECONDS"],
            "require_auth" => &["APP__REQUIRE_AUTH"],
            _ => &[],
        };
        names.iter().rev().find_map(|name| std::env::var(name).ok())
    });
    settings
}

/// `server.toml` holds flat keys; unknown keys and unparsable values are
/// ignored, as is a file that is not TOML at all.
fn apply_file_settings(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        return;
    };
    apply_overrides(settings, |key| {
        file_cfg.get(key).map(|value| match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    });
}

fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(bind) = lookup("bind_addr") {
        settings.server_bind = bind;
    }
    if let Some(url) = lookup("database_url") {
        settings.database_url = url;
    }
    if let Some(secret) = lookup("jwt_secret") {
        settings.jwt_secret = secret;
    }
    if let Some(ttl) = lookup("token_ttl_seconds").and_then(|v| v.trim().parse::<i64>().ok()) {
        settings.token_ttl_seconds = ttl;
    }
    if let Some(flag) = lookup("require_auth").as_deref().and_then(parse_flag) {
        settings.require_auth = flag;
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Accepts bare file paths as well as `sqlite:` urls. Blank input falls back
/// to the default database.
pub fn normalize_database_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return Settings::default().database_url;
    }
    if raw.starts_with("sqlite::memory:") || raw.contains("://") {
        return raw.to_string();
    }
    let path = raw.strip_prefix("sqlite:").unwrap_or(raw);
    format!("sqlite://{}", path.replace('\\', "/"))
}
