use std::{collections::HashSet, env, time::Duration};

use axum::http::HeaderMap;

use crate::error::BridgeError;

/// Library-side knobs every bridge is built with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Delay before the first `chainChanged` is pushed to a fresh page.
    pub initial_chain_delay: Duration,
    /// Chain enum used when a site never picked one.
    pub default_chain: String,
    /// Extra keys stripped from responses on top of the built-in denylist.
    pub sanitize_fields: Vec<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            initial_chain_delay: Duration::from_millis(500),
            default_chain: "ETH".to_string(),
            sanitize_fields: Vec::new(),
        }
    }
}

/// Dev host configuration, read from `BRIDGE_*` variables.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub auth_token: Option<String>,
    pub auth_enabled: bool,
    pub allow_insecure_no_auth: bool,
    pub allow_query_token_auth: bool,
    pub auto_connect: bool,
    pub accounts: Vec<String>,
    pub settings: BridgeSettings,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, BridgeError> {
        let host = env::var("BRIDGE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("BRIDGE_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8787);

        let auth_token = env::var("BRIDGE_AUTH_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let allow_insecure_no_auth = parse_bool_env("BRIDGE_ALLOW_INSECURE_NO_AUTH");
        if auth_token.is_none() && !allow_insecure_no_auth {
            return Err(BridgeError::Config(
                "BRIDGE_AUTH_TOKEN is required. Set BRIDGE_ALLOW_INSECURE_NO_AUTH=true only for local development."
                    .to_string(),
            ));
        }

        let auth_enabled = auth_token.is_some();
        let allow_query_token_auth = parse_bool_env("BRIDGE_ALLOW_QUERY_TOKEN_AUTH");
        let auto_connect = parse_bool_env("BRIDGE_AUTO_CONNECT");

        let mut settings = BridgeSettings::default();
        if let Ok(raw) = env::var("BRIDGE_INITIAL_CHAIN_DELAY_MS") {
            let millis = raw.trim().parse::<u64>().map_err(|_| {
                BridgeError::Config(format!("BRIDGE_INITIAL_CHAIN_DELAY_MS is not a number: {raw}"))
            })?;
            settings.initial_chain_delay = Duration::from_millis(millis);
        }
        if let Some(chain) = env::var("BRIDGE_DEFAULT_CHAIN")
            .ok()
            .map(|v| v.trim().to_ascii_uppercase())
            .filter(|v| !v.is_empty())
        {
            settings.default_chain = chain;
        }
        settings.sanitize_fields = parse_csv_env("BRIDGE_SANITIZE_FIELDS");

        Ok(Self {
            host,
            port,
            auth_token,
            auth_enabled,
            allow_insecure_no_auth,
            allow_query_token_auth,
            auto_connect,
            accounts: parse_csv_env("BRIDGE_ACCOUNTS"),
            settings,
        })
    }

    pub fn is_authorized(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        if !self.auth_enabled {
            return true;
        }

        let expected = match &self.auth_token {
            Some(token) => token,
            None => return false,
        };

        if let Some(value) = headers.get("authorization") {
            if let Ok(raw) = value.to_str() {
                if let Some(token) = raw.strip_prefix("Bearer ") {
                    if token.trim() == expected {
                        return true;
                    }
                }
            }
        }

        if self.allow_query_token_auth {
            if let Some(token) = query_token {
                if token == expected {
                    return true;
                }
            }
        }

        false
    }
}

fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

// Order is kept and duplicates dropped.
fn parse_csv_env(name: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .filter(|entry| seen.insert(entry.to_string()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
