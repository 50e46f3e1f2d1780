use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com/common";
const DEFAULT_REDIRECT_PORT: u16 = 23456;

/// Settings read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Application id registered with the identity provider.
    pub client_id: String,
    /// Base address of the to-do list web API.
    pub api_base_url: String,
    pub authority: String,
    pub scopes: Vec<String>,
    pub redirect_port: u16,
    pub token_cache_path: PathBuf,
}

impl Config {
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/redirect", self.redirect_port)
    }

    pub fn authorize_url(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.authority)
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority)
    }
}

pub fn read_config_from_env() -> Result<Config> {
    read_config(|key| env::var(key).ok())
}

/// Builds a [`Config`] from any key lookup so tests need not touch the
/// process environment.
pub fn read_config<F>(lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |key: &str| {
        lookup(key)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("{key} must be set (see .env.example)"))
    };

    let client_id = required("TODO_CLIENT_ID")?;
    let api_base_url = required("TODO_API_BASE_URL")?;

    let authority = lookup("TODO_AUTHORITY")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_AUTHORITY.to_string());

    let scopes = match lookup("TODO_SCOPES") {
        Some(value) => value.split_whitespace().map(str::to_string).collect(),
        None => vec![client_id.clone(), "offline_access".to_string()],
    };

    let redirect_port = match lookup("TODO_REDIRECT_PORT") {
        Some(value) => value
            .parse()
            .with_context(|| format!("TODO_REDIRECT_PORT is not a port number: {value}"))?,
        None => DEFAULT_REDIRECT_PORT,
    };

    let token_cache_path = match lookup("TODO_TOKEN_CACHE") {
        Some(value) => PathBuf::from(value),
        None => dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("todolist-client")
            .join("token_cache.json"),
    };

    Ok(Config {
        client_id,
        api_base_url,
        authority,
        scopes,
        redirect_port,
        token_cache_path,
    })
}
