use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix; `SHIPYARD_SERVER__PORT` sets `server.port`
const ENV_PREFIX: &str = "SHIPYARD";

/// Keys picked up from the environment that only steer loading itself
const LOADER_KEYS: &[&str] = &["config_dir", "config_run_mode"];

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Endpoint reported back to clients after a successful build
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            endpoint: default_endpoint(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSettings {
    /// Parent directory for per-request working directories (system temp dir when unset)
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Total uncompressed size an uploaded bundle may expand to
    #[serde(default = "default_max_extracted_bytes")]
    pub max_extracted_bytes: u64,
    /// Limit for each of the build and publish stages
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Builds allowed to run at once; further requests get 503. 0 means unbounded.
    #[serde(default)]
    pub max_concurrent_builds: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tmp_dir: None,
            max_upload_bytes: default_max_upload_bytes(),
            max_extracted_bytes: default_max_extracted_bytes(),
            stage_timeout_secs: default_stage_timeout_secs(),
            max_concurrent_builds: 0,
        }
    }
}

impl PipelineSettings {
    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(env::temp_dir)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendSettings {
    /// `docker` or `podman`
    #[serde(default = "default_container_cli")]
    pub container_cli: String,
    /// Passed as `--platform` when set, e.g. "linux/amd64"
    #[serde(default)]
    pub platform: Option<String>,
    /// Base image of the generated Dockerfile
    #[serde(default = "default_base_image")]
    pub base_image: String,
    #[serde(default = "default_exposed_port")]
    pub exposed_port: u16,
    /// Forward HTTP(S)_PROXY / NO_PROXY from the service environment as build args
    #[serde(default = "default_forward_proxy")]
    pub forward_proxy: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            container_cli: default_container_cli(),
            platform: None,
            base_image: default_base_image(),
            exposed_port: default_exposed_port(),
            forward_proxy: default_forward_proxy(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RegistrySettings {
    /// Registry images are pushed to, e.g. "registry.example.com:5000"
    #[serde(default)]
    pub url: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_endpoint() -> String {
    "http://endpointyouhit:8080".to_string()
}

fn default_max_upload_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_max_extracted_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_stage_timeout_secs() -> u64 {
    600
}

fn default_container_cli() -> String {
    "docker".to_string()
}

fn default_base_image() -> String {
    "node:20-alpine".to_string()
}

fn default_exposed_port() -> u16 {
    8080
}

fn default_forward_proxy() -> bool {
    true
}

impl Settings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        let re = match regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
            Ok(re) => re,
            Err(_) => return s.to_string(),
        };

        re.replace_all(s, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match env::var(var_name) {
                Ok(val) => val,
                Err(_) => default_value.unwrap_or("").to_string(),
            }
        })
        .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, performing environment variable substitution
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let mut map = serde_json::Map::new();
                for (k, v) in table.iter() {
                    map.insert(k.clone(), Self::config_value_to_json(v));
                }
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                let vec: Vec<serde_json::Value> =
                    arr.iter().map(Self::config_value_to_json).collect();
                serde_json::Value::Array(vec)
            }
        }
    }

    /// Try to add a config file with multiple extension attempts (.toml, .yaml, .yml)
    /// Returns Ok(true) if a file was loaded, Ok(false) if no file found (when not required)
    fn try_add_config_file(
        builder: &mut config::ConfigBuilder<config::builder::DefaultState>,
        config_dir: &str,
        name: &str,
        required: bool,
    ) -> Result<bool, ConfigError> {
        let extensions = ["toml", "yaml", "yml"];

        for ext in extensions {
            let path = format!("{}/{}.{}", config_dir, name, ext);
            if std::path::Path::new(&path).exists() {
                tracing::info!("Loading config file: {}", path);
                *builder = builder
                    .clone()
                    .add_source(config::File::with_name(&format!("{}/{}", config_dir, name)));
                return Ok(true);
            }
        }

        if required {
            Err(ConfigError::Message(format!(
                "Required config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir, name
            )))
        } else {
            tracing::debug!(
                "Optional config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir,
                name
            );
            Ok(false)
        }
    }

    /// Load settings from `SHIPYARD_CONFIG_DIR` (default `config`) and
    /// `SHIPYARD_CONFIG_RUN_MODE` (default `development`)
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode =
            env::var("SHIPYARD_CONFIG_RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("SHIPYARD_CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::load(&config_dir, &run_mode)
    }

    pub fn load(config_dir: &str, run_mode: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Every file is optional: the defaults above cover all but the registry
        Self::try_add_config_file(&mut builder, config_dir, "default", false)?;
        Self::try_add_config_file(&mut builder, config_dir, run_mode, false)?;
        Self::try_add_config_file(&mut builder, config_dir, "local", false)?;

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in unused_fields
            .iter()
            .filter(|f| !LOADER_KEYS.contains(&f.as_str()))
        {
            tracing::warn!("Unknown configuration field: {}", field);
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.url.trim().is_empty() {
            return Err(ConfigError::Message(
                "Registry URL not configured. Set SHIPYARD_REGISTRY__URL environment variable or [registry] url in config".to_string(),
            ));
        }
        if self.backend.container_cli.trim().is_empty() {
            return Err(ConfigError::Message(
                "backend.container_cli must name a container CLI such as docker or podman"
                    .to_string(),
            ));
        }
        if self.pipeline.max_upload_bytes == 0 {
            return Err(ConfigError::Message(
                "pipeline.max_upload_bytes must be greater than 0".to_string(),
            ));
        }
        if self.pipeline.max_extracted_bytes < self.pipeline.max_upload_bytes {
            return Err(ConfigError::Message(
                "pipeline.max_extracted_bytes must be at least pipeline.max_upload_bytes"
                    .to_string(),
            ));
        }
        if self.pipeline.stage_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "pipeline.stage_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
