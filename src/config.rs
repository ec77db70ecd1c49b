use std::{collections::BTreeMap, env, fmt, fs, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{error::RegistryError, schema_registry::DEFAULT_REFRESH_INTERVAL};

pub const ENV_VAR: &str = "STITCHGATE_ENV";
pub const TOKEN_VAR: &str = "GITHUB_TOKEN";

const PRODUCTION: &str = "production";

/// Deployment environment tag; selects endpoint URLs and the load path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment(String);

impl Environment {
    pub fn new(tag: impl Into<String>) -> Self {
        Environment(tag.into())
    }

    pub fn production() -> Self {
        Environment::new(PRODUCTION)
    }

    pub fn development() -> Self {
        Environment::new("development")
    }

    pub fn is_production(&self) -> bool {
        self.0 == PRODUCTION
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::development()
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    pub registry_path: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

/// A configured service with one URL per environment.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub url: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn url_for(&self, env: &Environment) -> Result<&str, RegistryError> {
        self.url
            .get(env.as_str())
            .map(String::as_str)
            .ok_or_else(|| RegistryError::UnknownEndpoint {
                name: self.name.clone(),
                env: env.to_string(),
            })
    }

    /// URL recorded in published registry files.
    pub fn publish_url(&self) -> Option<&str> {
        self.url.get(PRODUCTION).map(String::as_str)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub env: Environment,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    pub github: GitHubConfig,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl Config {
    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(contents).context("Failed to parse config file")
    }

    /// Reads a YAML config file and applies environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Config::from_yaml(&contents)?;
        if let Ok(env) = env::var(ENV_VAR) {
            config.env = Environment::new(env);
        }
        Ok(config)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn github_token() -> Option<String> {
        env::var(TOKEN_VAR).ok().filter(|token| !token.is_empty())
    }
}

fn default_main_branch() -> String {
    "main".to_string()
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_refresh_interval_ms() -> u64 {
    DEFAULT_REFRESH_INTERVAL.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use serial_test::serial;

    use super::*;

    const CONFIG: &str = r#"
env: development
github:
  owner: acme
  repo: schemas
  registry_path: schemas
endpoints:
  - name: accounts
    url:
      development: http://localhost:4001/graphql
      production: https://accounts.internal/graphql
  - name: reviews
    url:
      development: http://localhost:4002/graphql
"#;

    #[test]
    fn parses_config_with_defaults() {
        let config = Config::from_yaml(CONFIG).unwrap();

        assert_eq!(config.env, Environment::development());
        assert_eq!(config.refresh_interval(), Duration::from_millis(5000));
        assert_eq!(config.github.main_branch, "main");
        assert_eq!(config.github.api_url, "https://api.github.com");
        assert_eq!(config.endpoints.len(), 2);
    }

    #[test]
    fn parses_bundled_config() {
        let config = Config::from_yaml(include_str!("../stitchgate.yaml")).unwrap();

        assert_eq!(config.github.repo, "gateway-schemas");
        assert!(config.endpoints.iter().all(|e| e.publish_url().is_some()));
    }

    #[test]
    fn resolves_endpoint_urls_per_environment() {
        let config = Config::from_yaml(CONFIG).unwrap();
        let accounts = &config.endpoints[0];
        let reviews = &config.endpoints[1];

        assert_eq!(
            accounts.url_for(&Environment::production()).unwrap(),
            "https://accounts.internal/graphql"
        );
        assert_eq!(accounts.publish_url(), Some("https://accounts.internal/graphql"));
        assert_eq!(reviews.publish_url(), None);
        assert!(matches!(
            reviews.url_for(&Environment::production()),
            Err(RegistryError::UnknownEndpoint { .. })
        ));
    }

    #[test]
    #[serial]
    fn environment_variable_overrides_file() {
        let mut file = temp_config_file();
        file.1.write_all(CONFIG.as_bytes()).unwrap();

        // SAFETY: serialized with the other env-mutating tests.
        unsafe { env::set_var(ENV_VAR, "production") };
        let config = Config::load(&file.0);
        unsafe { env::remove_var(ENV_VAR) };

        assert!(config.unwrap().env.is_production());
        fs::remove_file(&file.0).unwrap();
    }

    #[test]
    #[serial]
    fn empty_token_is_ignored() {
        // SAFETY: serialized with the other env-mutating tests.
        unsafe { env::set_var(TOKEN_VAR, "") };
        assert_eq!(Config::github_token(), None);
        unsafe { env::set_var(TOKEN_VAR, "abc") };
        assert_eq!(Config::github_token(), Some("abc".to_string()));
        unsafe { env::remove_var(TOKEN_VAR) };
    }

    fn temp_config_file() -> (std::path::PathBuf, fs::File) {
        let path = env::temp_dir().join(format!("stitchgate-config-{}.yaml", std::process::id()));
        let file = fs::File::create(&path).unwrap();
        (path, file)
    }
}
