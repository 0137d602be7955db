use crate::error::{to_env_var, ConfigError, ENV_PREFIX};
use config::{Config, Environment};
use minichain::agent::{DEFAULT_KEEP_FIRST, DEFAULT_KEEP_LAST};
use minichain::cache::DEFAULT_CACHE_DIR;
use minichain::providers::configs::{
    OpenAiProviderConfig, OPENAI_DEFAULT_HOST, OPENAI_DEFAULT_MODEL,
};
use minichain::sandbox::DockerConfig;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful assistant. \
You can run bash commands and python code to solve the task you are given. \
When you are done, reply with a short summary of what you did.";

#[derive(Debug, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_openai_host")]
    pub host: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
}

impl ProviderSettings {
    pub fn into_config(self) -> Result<OpenAiProviderConfig, ConfigError> {
        let api_key = self.api_key.ok_or_else(|| ConfigError::MissingEnvVar {
            env_var: to_env_var("provider.api_key"),
        })?;
        Ok(OpenAiProviderConfig {
            host: self.host,
            api_key,
            model: self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_keep_first")]
    pub keep_first: usize,
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
    #[serde(default)]
    pub max_turns: Option<usize>,
    #[serde(default)]
    pub system_message: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            keep_first: default_keep_first(),
            keep_last: default_keep_last(),
            max_turns: None,
            system_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    /// One container per session
    Docker,
    /// The host's own shell, without isolation
    Host,
}

#[derive(Debug, Deserialize)]
pub struct SandboxSettings {
    #[serde(default = "default_backend")]
    pub backend: SandboxBackend,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default)]
    pub network: Option<String>,
    /// Host directory bind mounted at `workdir`, defaults to the current directory
    #[serde(default)]
    pub mount: Option<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            image: default_image(),
            workdir: default_workdir(),
            network: None,
            mount: None,
        }
    }
}

impl SandboxSettings {
    pub fn docker_config(&self, mount: &std::path::Path) -> DockerConfig {
        DockerConfig {
            image: self.image.clone(),
            network: self.network.clone(),
            workdir: self.workdir.clone(),
            mount: Some((mount.display().to_string(), self.workdir.clone())),
            ..DockerConfig::default()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_cache_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub provider: ProviderSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(&[])
    }

    /// Load settings, letting `overrides` (dotted key, value) win over the environment
    pub fn load(overrides: &[(&str, String)]) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            // Provider defaults
            .set_default("provider.host", default_openai_host())?
            .set_default("provider.model", default_model())?;

        // The usual OpenAI variable works too, the prefixed one takes precedence
        if let Ok(api_key) = env::var("OPENAI_API_KEY") {
            builder = builder.set_default("provider.api_key", api_key)?;
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        for (key, value) in overrides {
            builder = builder.set_override(*key, value.as_str())?;
        }

        let config = builder.build()?;
        let result: Result<Self, config::ConfigError> = config.try_deserialize();

        match result {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                let error_str = err.to_string();
                if error_str.starts_with("missing field") {
                    // "missing field `provider`"
                    let field = error_str
                        .trim_start_matches("missing field `")
                        .split('`')
                        .next()
                        .unwrap_or_default();
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                }
            }
        }
    }
}

fn default_openai_host() -> String {
    OPENAI_DEFAULT_HOST.to_string()
}

fn default_model() -> String {
    OPENAI_DEFAULT_MODEL.to_string()
}

fn default_keep_first() -> usize {
    DEFAULT_KEEP_FIRST
}

fn default_keep_last() -> usize {
    DEFAULT_KEEP_LAST
}

fn default_backend() -> SandboxBackend {
    SandboxBackend::Docker
}

fn default_image() -> String {
    DockerConfig::default().image
}

fn default_workdir() -> String {
    DockerConfig::default().workdir
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}
