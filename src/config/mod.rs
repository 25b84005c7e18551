use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use url::Url;

/// Application configuration, merged by Figment from (in order) built-in
/// defaults, `<data_dir>/config.json`, and environment overrides for the
/// OAuth client pair (`OAUTH_CLIENT_ID`, `OAUTH_CLIENT_SECRET`).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub oauth: OauthConfig,

    #[serde(default)]
    pub defaults: GenerationDefaults,

    #[serde(default)]
    pub security: SecurityConfig,

    /// Instruction text prepended to every upstream `systemInstruction`.
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Upstream endpoints. Hosts live in configuration, never in code.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// Streaming generate endpoint.
    pub url: Url,
    /// Models listing endpoint.
    pub models_url: Url,
    /// Identity-provider token endpoint.
    pub host: Url,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OauthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationDefaults {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    /// Request bodies above this many bytes are rejected with 413.
    pub max_request_size: usize,
    /// Admin-wide key: authorizes without touching the per-key limiter.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub admin_password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: Url::parse("https://daily-cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse")
                .expect("valid default upstream URL"),
            models_url: Url::parse("https://daily-cloudcode-pa.googleapis.com/v1internal:fetchAvailableModels")
                .expect("valid default models URL"),
            host: Url::parse("https://oauth2.googleapis.com/token")
                .expect("valid default token endpoint URL"),
            user_agent: "antigravity/1.11.5 (linux; x64)".to_string(),
        }
    }
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.95,
            top_k: 64,
            max_tokens: 65535,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_request_size: 50 * 1024 * 1024,
            api_key: None,
            admin_password: String::new(),
        }
    }
}

fn default_host() -> IpAddr {
    Ipv4Addr::new(0, 0, 0, 0).into()
}

fn default_port() -> u16 {
    3000
}

fn default_system_instruction() -> String {
    "You are a helpful assistant.".to_string()
}

impl Config {
    /// Builds a Figment over defaults, an optional config file, and env vars.
    pub fn figment(config_path: &Path) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if config_path.is_file() {
            figment = figment.merge(Json::file(config_path));
        }
        figment
            .merge(
                Env::raw()
                    .only(&["OAUTH_CLIENT_ID"])
                    .map(|_| "oauth.clientId".into())
                    .split("."),
            )
            .merge(
                Env::raw()
                    .only(&["OAUTH_CLIENT_SECRET"])
                    .map(|_| "oauth.clientSecret".into())
                    .split("."),
            )
    }

    /// Loads configuration; a malformed config file fails loudly.
    pub fn load(config_path: &Path) -> Result<Self, figment::Error> {
        Self::figment(config_path).extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let cfg = Config::load(Path::new("/nonexistent/config.json")).unwrap();
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.defaults.top_k, 64);
        assert!(cfg.security.api_key.is_none());
        assert!(!cfg.system_instruction.is_empty());
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!(
            "castor-config-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(
            &path,
            r#"{
                "server": {"port": 8017},
                "oauth": {"clientId": "id-1", "clientSecret": "sec-1"},
                "security": {"maxRequestSize": 1024, "apiKey": "admin-key", "adminPassword": "pw"}
            }"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.server.port, 8017);
        assert_eq!(cfg.oauth.client_id, "id-1");
        assert_eq!(cfg.security.max_request_size, 1024);
        assert_eq!(cfg.security.api_key.as_deref(), Some("admin-key"));
    }
}
