use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub public_url: String,
    pub client_url: Option<String>,
    pub token_ttl_hours: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = get("CIRCLE_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("CIRCLE_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let port = or("CIRCLE_PORT", "3000")
            .parse()
            .context("CIRCLE_PORT must be a port number")?;
        let token_ttl_hours = or("CIRCLE_TOKEN_TTL_HOURS", "24")
            .parse()
            .context("CIRCLE_TOKEN_TTL_HOURS must be a whole number of hours")?;
        if token_ttl_hours <= 0 {
            bail!("CIRCLE_TOKEN_TTL_HOURS must be positive");
        }

        Ok(Self {
            jwt_secret,
            db_path: or("CIRCLE_DB_PATH", "circle.db").into(),
            host: or("CIRCLE_HOST", "0.0.0.0"),
            port,
            storage_dir: or("CIRCLE_STORAGE_DIR", "./uploads").into(),
            public_url: or("CIRCLE_PUBLIC_URL", "http://localhost:3000"),
            client_url: get("CIRCLE_CLIENT_URL").filter(|url| !url.is_empty()),
            token_ttl_hours,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
