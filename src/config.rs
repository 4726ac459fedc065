use mongodb::options::{ClientOptions, Credential, Tls, TlsOptions};
use serde::Deserialize;

/// Service configuration. Loaded from an optional TOML file (path in
/// `INVENTORY_CONFIG`) with `INVENTORY_*` environment overrides on top.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_mongo")]
    pub mongo: String,
    #[serde(default)]
    pub mongo_ssl: bool,
    #[serde(default)]
    pub mongo_ssl_skipverify: bool,
    #[serde(default)]
    pub mongo_username: Option<String>,
    #[serde(default)]
    pub mongo_password: Option<String>,
    #[serde(default = "default_db_name")]
    pub db_name: String,
    /// Attribute count limit for the inventory scope. 0 = unlimited.
    #[serde(default = "default_limit_attributes")]
    pub limit_attributes: usize,
    /// Attribute count limit for the tags scope. 0 = unlimited.
    #[serde(default = "default_limit_tags")]
    pub limit_tags: usize,
    #[serde(default)]
    pub devicemonitor_addr: Option<String>,
    #[serde(default)]
    pub orchestrator_addr: Option<String>,
    #[serde(default)]
    pub enable_reporting: bool,
    /// Apply pending migrations at startup instead of failing on a version
    /// mismatch.
    #[serde(default)]
    pub automigrate: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_mongo() -> String {
    "mongodb://127.0.0.1:27017".to_string()
}

fn default_db_name() -> String {
    "inventory".to_string()
}

fn default_limit_attributes() -> usize {
    100
}

fn default_limit_tags() -> usize {
    20
}

impl Default for Config {
    fn default() -> Self {
        // the serde defaults are the defaults
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Config> {
        let mut config = match std::env::var("INVENTORY_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("reading config file {path}: {e}"))?;
                toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("parsing config file {path}: {e}"))?
            }
            Err(_) => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Build the shared MongoDB client, applying credentials and TLS options.
    pub async fn mongo_client(&self) -> anyhow::Result<mongodb::Client> {
        let mut options = ClientOptions::parse(&self.mongo).await?;
        if let (Some(username), Some(password)) = (&self.mongo_username, &self.mongo_password) {
            options.credential = Some(
                Credential::builder()
                    .username(username.clone())
                    .password(password.clone())
                    .build(),
            );
        }
        if self.mongo_ssl {
            options.tls = Some(Tls::Enabled(
                TlsOptions::builder()
                    .allow_invalid_certificates(self.mongo_ssl_skipverify)
                    .build(),
            ));
        }
        Ok(mongodb::Client::with_options(options)?)
    }

    fn apply_env(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        if let Some(v) = var("INVENTORY_LISTEN") {
            self.listen = v;
        }
        if let Some(v) = var("INVENTORY_MONGO") {
            self.mongo = v;
        }
        if let Some(v) = var("INVENTORY_MONGO_SSL").and_then(|v| v.parse().ok()) {
            self.mongo_ssl = v;
        }
        if let Some(v) = var("INVENTORY_MONGO_SSL_SKIPVERIFY").and_then(|v| v.parse().ok()) {
            self.mongo_ssl_skipverify = v;
        }
        if let Some(v) = var("INVENTORY_MONGO_USERNAME") {
            self.mongo_username = Some(v);
        }
        if let Some(v) = var("INVENTORY_MONGO_PASSWORD") {
            self.mongo_password = Some(v);
        }
        if let Some(v) = var("INVENTORY_DB_NAME") {
            self.db_name = v;
        }
        if let Some(v) = var("INVENTORY_LIMIT_ATTRIBUTES").and_then(|v| v.parse().ok()) {
            self.limit_attributes = v;
        }
        if let Some(v) = var("INVENTORY_LIMIT_TAGS").and_then(|v| v.parse().ok()) {
            self.limit_tags = v;
        }
        if let Some(v) = var("INVENTORY_DEVICEMONITOR_ADDR") {
            self.devicemonitor_addr = Some(v);
        }
        if let Some(v) = var("INVENTORY_ORCHESTRATOR_ADDR") {
            self.orchestrator_addr = Some(v);
        }
        if let Some(v) = var("INVENTORY_ENABLE_REPORTING").and_then(|v| v.parse().ok()) {
            self.enable_reporting = v;
        }
        if let Some(v) = var("INVENTORY_AUTOMIGRATE").and_then(|v| v.parse().ok()) {
            self.automigrate = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.mongo, "mongodb://127.0.0.1:27017");
        assert_eq!(config.db_name, "inventory");
        assert_eq!(config.limit_attributes, 100);
        assert_eq!(config.limit_tags, 20);
        assert!(!config.enable_reporting);
        assert!(!config.automigrate);
    }

    #[test]
    fn toml_overrides() {
        let config: Config = toml::from_str(
            r#"
            listen = "127.0.0.1:9090"
            mongo = "mongodb://db:27017"
            limit_tags = 5
            enable_reporting = true
            orchestrator_addr = "http://orchestrator:8080"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:9090");
        assert_eq!(config.limit_tags, 5);
        assert_eq!(config.limit_attributes, 100);
        assert!(config.enable_reporting);
        assert_eq!(
            config.orchestrator_addr.as_deref(),
            Some("http://orchestrator:8080")
        );
    }
}
