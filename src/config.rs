//! Runtime configuration for the API server.
//!
//! Settings resolve with precedence CLI flag > environment variable >
//! JSON config file (`ACESTEP_CONFIG_PATH`) > compiled default. A `.env`
//! file in the working directory is loaded before resolution and only
//! fills environment variables that are not already set.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, Result};

/// Command-line arguments.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "acestep-api", about = "ACE-Step audio generation API server")]
pub struct Cli {
    /// Bind address.
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long)]
    pub port: Option<u16>,

    /// API key; unset or empty disables authentication.
    #[arg(long)]
    pub api_key: Option<String>,

    /// Model download source: auto, huggingface or modelscope.
    #[arg(long)]
    pub download_source: Option<String>,

    /// Language model init policy: auto, true or false.
    #[arg(long)]
    pub init_llm: Option<String>,

    /// Language model selection.
    #[arg(long)]
    pub lm_model_path: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Where model weights are fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadSource {
    Auto,
    HuggingFace,
    ModelScope,
}

impl FromStr for DownloadSource {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DownloadSource::Auto),
            "huggingface" => Ok(DownloadSource::HuggingFace),
            "modelscope" => Ok(DownloadSource::ModelScope),
            other => Err(ApiError::Config(format!(
                "invalid download source {other:?} (expected auto|huggingface|modelscope)"
            ))),
        }
    }
}

/// Tri-state language model initialization policy.
///
/// `Auto` loads the LM at startup only when detected free accelerator
/// memory exceeds [`crate::model::manager::LM_AUTO_VRAM_THRESHOLD`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LmInitPolicy {
    Auto,
    Enabled,
    Disabled,
}

impl FromStr for LmInitPolicy {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(LmInitPolicy::Auto),
            "true" | "1" | "yes" => Ok(LmInitPolicy::Enabled),
            "false" | "0" | "no" => Ok(LmInitPolicy::Disabled),
            other => Err(ApiError::Config(format!(
                "invalid init-llm value {other:?} (expected auto|true|false)"
            ))),
        }
    }
}

/// Language model inference backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LmBackend {
    Vllm,
    Pt,
}

impl fmt::Display for LmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LmBackend::Vllm => write!(f, "vllm"),
            LmBackend::Pt => write!(f, "pt"),
        }
    }
}

impl FromStr for LmBackend {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vllm" => Ok(LmBackend::Vllm),
            "pt" => Ok(LmBackend::Pt),
            other => Err(ApiError::Config(format!(
                "invalid LM backend {other:?} (expected vllm|pt)"
            ))),
        }
    }
}

/// Accelerator preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Auto,
    Cuda,
    Cpu,
    Xpu,
}

impl FromStr for DevicePreference {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cuda" => Ok(DevicePreference::Cuda),
            "cpu" => Ok(DevicePreference::Cpu),
            "xpu" => Ok(DevicePreference::Xpu),
            other => Err(ApiError::Config(format!(
                "invalid device {other:?} (expected auto|cuda|cpu|xpu)"
            ))),
        }
    }
}

/// Optional JSON config file, pointed at by `ACESTEP_CONFIG_PATH`.
/// Every field is optional; set fields sit below env vars in precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub download_source: Option<String>,
    pub init_llm: Option<String>,
    pub lm_model_path: Option<String>,
    pub lm_backend: Option<String>,
    pub device: Option<String>,
    pub use_flash_attention: Option<bool>,
    pub offload_to_cpu: Option<bool>,
    pub offload_dit_to_cpu: Option<bool>,
    pub lm_offload_to_cpu: Option<bool>,
    pub queue_maxsize: Option<usize>,
    pub queue_workers: Option<usize>,
    pub tmpdir: Option<PathBuf>,
}

impl FileConfig {
    fn load(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| ApiError::Config(format!("config file {}: {e}", path.display())))
    }
}

/// Resolved, immutable server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address.
    pub host: String,

    /// Bind port.
    pub port: u16,

    /// API key. `None` disables authentication entirely.
    pub api_key: Option<String>,

    /// Model download source.
    pub download_source: DownloadSource,

    /// LM init policy.
    pub init_llm: LmInitPolicy,

    /// LM model selection.
    pub lm_model_path: String,

    /// LM inference backend.
    pub lm_backend: LmBackend,

    /// Accelerator preference.
    pub device: DevicePreference,

    /// Enable flash attention kernels in the DiT.
    pub use_flash_attention: bool,

    /// Offload all idle models to CPU memory.
    pub offload_to_cpu: bool,

    /// Offload the idle DiT to CPU memory.
    pub offload_dit_to_cpu: bool,

    /// Offload the idle LM to CPU memory.
    pub lm_offload_to_cpu: bool,

    /// Maximum pending generation requests.
    pub queue_maxsize: usize,

    /// Number of generation workers.
    pub queue_workers: usize,

    /// Directory for spooled audio uploads; system tmpdir when unset.
    pub tmpdir: Option<PathBuf>,

    /// Kernel cache directory, recorded from `TRITON_CACHE_DIR`.
    pub triton_cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            api_key: None,
            download_source: DownloadSource::Auto,
            init_llm: LmInitPolicy::Auto,
            lm_model_path: "acestep-5Hz-lm-0.6B".to_string(),
            lm_backend: LmBackend::Vllm,
            device: DevicePreference::Auto,
            use_flash_attention: false,
            offload_to_cpu: false,
            offload_dit_to_cpu: false,
            lm_offload_to_cpu: false,
            queue_maxsize: 200,
            queue_workers: 1,
            tmpdir: None,
            triton_cache_dir: None,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ApiError::Config(format!(
            "invalid boolean {other:?} for {name}"
        ))),
    }
}

impl Config {
    /// Resolve configuration from CLI arguments and the process environment.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::resolve_from(cli, &env)
    }

    /// Resolve from an explicit environment map. Precedence per field:
    /// CLI > env > config file > default.
    pub fn resolve_from(cli: &Cli, env: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| -> Option<String> {
            env.get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let file = match get("ACESTEP_CONFIG_PATH") {
            Some(path) => FileConfig::load(std::path::Path::new(&path))?,
            None => FileConfig::default(),
        };

        let defaults = Config::default();

        let host = cli
            .host
            .clone()
            .or_else(|| get("ACESTEP_API_HOST"))
            .or(file.host)
            .unwrap_or(defaults.host);

        let port = match cli.port {
            Some(p) => p,
            None => match get("ACESTEP_API_PORT") {
                Some(raw) => raw
                    .parse::<u16>()
                    .map_err(|_| ApiError::Config(format!("invalid port {raw:?}")))?,
                None => file.port.unwrap_or(defaults.port),
            },
        };

        // An explicitly empty --api-key disables auth, same as unset.
        let api_key = cli
            .api_key
            .clone()
            .or_else(|| env.get("ACESTEP_API_KEY").cloned())
            .or(file.api_key)
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        let download_source = cli
            .download_source
            .clone()
            .or_else(|| get("ACESTEP_DOWNLOAD_SOURCE"))
            .or(file.download_source)
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(defaults.download_source);

        let init_llm = cli
            .init_llm
            .clone()
            .or_else(|| get("ACESTEP_INIT_LLM"))
            .or(file.init_llm)
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(defaults.init_llm);

        let lm_model_path = cli
            .lm_model_path
            .clone()
            .or_else(|| get("ACESTEP_LM_MODEL_PATH"))
            .or(file.lm_model_path)
            .unwrap_or(defaults.lm_model_path);

        let lm_backend = get("ACESTEP_LM_BACKEND")
            .or(file.lm_backend)
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(defaults.lm_backend);

        let device = get("ACESTEP_DEVICE")
            .or(file.device)
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(defaults.device);

        let env_bool = |name: &str, file_value: Option<bool>, default: bool| -> Result<bool> {
            match get(name) {
                Some(raw) => parse_bool(name, &raw),
                None => Ok(file_value.unwrap_or(default)),
            }
        };

        let use_flash_attention = env_bool(
            "ACESTEP_USE_FLASH_ATTENTION",
            file.use_flash_attention,
            defaults.use_flash_attention,
        )?;
        let offload_to_cpu = env_bool(
            "ACESTEP_OFFLOAD_TO_CPU",
            file.offload_to_cpu,
            defaults.offload_to_cpu,
        )?;
        let offload_dit_to_cpu = env_bool(
            "ACESTEP_OFFLOAD_DIT_TO_CPU",
            file.offload_dit_to_cpu,
            defaults.offload_dit_to_cpu,
        )?;
        let lm_offload_to_cpu = env_bool(
            "ACESTEP_LM_OFFLOAD_TO_CPU",
            file.lm_offload_to_cpu,
            defaults.lm_offload_to_cpu,
        )?;

        let env_usize = |name: &str, file_value: Option<usize>, default: usize| -> Result<usize> {
            match get(name) {
                Some(raw) => raw
                    .parse::<usize>()
                    .map_err(|_| ApiError::Config(format!("invalid value {raw:?} for {name}"))),
                None => Ok(file_value.unwrap_or(default)),
            }
        };

        let queue_maxsize = env_usize(
            "ACESTEP_QUEUE_MAXSIZE",
            file.queue_maxsize,
            defaults.queue_maxsize,
        )?;
        let queue_workers = env_usize(
            "ACESTEP_QUEUE_WORKERS",
            file.queue_workers,
            defaults.queue_workers,
        )?;

        let tmpdir = get("ACESTEP_TMPDIR").map(PathBuf::from).or(file.tmpdir);
        let triton_cache_dir = get("TRITON_CACHE_DIR").map(PathBuf::from);

        let config = Config {
            host,
            port,
            api_key,
            download_source,
            init_llm,
            lm_model_path,
            lm_backend,
            device,
            use_flash_attention,
            offload_to_cpu,
            offload_dit_to_cpu,
            lm_offload_to_cpu,
            queue_maxsize,
            queue_workers,
            tmpdir,
            triton_cache_dir,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ApiError::Config("port must be non-zero".into()));
        }
        if self.lm_model_path.is_empty() {
            return Err(ApiError::Config("lm_model_path must not be empty".into()));
        }
        if self.queue_maxsize == 0 {
            return Err(ApiError::Config("queue_maxsize must be at least 1".into()));
        }
        if self.queue_workers == 0 {
            return Err(ApiError::Config("queue_workers must be at least 1".into()));
        }
        Ok(())
    }

    /// Socket address string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether requests must present the API key.
    pub fn auth_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Whether the DiT moves to CPU memory between jobs.
    pub fn dit_offload_enabled(&self) -> bool {
        self.offload_to_cpu || self.offload_dit_to_cpu
    }

    /// Whether the LM moves to CPU memory when released.
    pub fn lm_offload_enabled(&self) -> bool {
        self.offload_to_cpu || self.lm_offload_to_cpu
    }

    /// Directory for spooled uploads.
    pub fn spool_dir(&self) -> PathBuf {
        self.tmpdir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::resolve_from(&Cli::default(), &HashMap::new()).unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 8001);
        assert_eq!(cfg.api_key, None);
        assert_eq!(cfg.init_llm, LmInitPolicy::Auto);
        assert_eq!(cfg.lm_model_path, "acestep-5Hz-lm-0.6B");
        assert_eq!(cfg.queue_maxsize, 200);
        assert_eq!(cfg.queue_workers, 1);
    }

    #[test]
    fn test_cli_overrides_env() {
        let cli = Cli {
            port: Some(9000),
            ..Default::default()
        };
        let env = env(&[("ACESTEP_API_PORT", "8123")]);
        let cfg = Config::resolve_from(&cli, &env).unwrap();
        assert_eq!(cfg.port, 9000);
    }

    #[test]
    fn test_env_overrides_default() {
        let env = env(&[
            ("ACESTEP_API_HOST", "0.0.0.0"),
            ("ACESTEP_INIT_LLM", "true"),
            ("ACESTEP_LM_BACKEND", "pt"),
            ("ACESTEP_QUEUE_MAXSIZE", "50"),
            ("ACESTEP_OFFLOAD_TO_CPU", "1"),
        ]);
        let cfg = Config::resolve_from(&Cli::default(), &env).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.init_llm, LmInitPolicy::Enabled);
        assert_eq!(cfg.lm_backend, LmBackend::Pt);
        assert_eq!(cfg.queue_maxsize, 50);
        assert!(cfg.offload_to_cpu);
        assert!(cfg.dit_offload_enabled());
        assert!(cfg.lm_offload_enabled());
    }

    #[test]
    fn test_empty_api_key_disables_auth() {
        let vars = env(&[("ACESTEP_API_KEY", "")]);
        let cfg = Config::resolve_from(&Cli::default(), &vars).unwrap();
        assert!(!cfg.auth_enabled());

        let vars = env(&[("ACESTEP_API_KEY", "secret")]);
        let cfg = Config::resolve_from(&Cli::default(), &vars).unwrap();
        assert!(cfg.auth_enabled());
        assert_eq!(cfg.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let vars = env(&[("ACESTEP_API_PORT", "-1")]);
        assert!(Config::resolve_from(&Cli::default(), &vars).is_err());

        let vars = env(&[("ACESTEP_DOWNLOAD_SOURCE", "gitlab")]);
        assert!(Config::resolve_from(&Cli::default(), &vars).is_err());

        let vars = env(&[("ACESTEP_INIT_LLM", "maybe")]);
        assert!(Config::resolve_from(&Cli::default(), &vars).is_err());

        let vars = env(&[("ACESTEP_QUEUE_WORKERS", "0")]);
        assert!(Config::resolve_from(&Cli::default(), &vars).is_err());
    }

    #[test]
    fn test_tri_state_parsing() {
        assert_eq!("auto".parse::<LmInitPolicy>().unwrap(), LmInitPolicy::Auto);
        assert_eq!("true".parse::<LmInitPolicy>().unwrap(), LmInitPolicy::Enabled);
        assert_eq!("false".parse::<LmInitPolicy>().unwrap(), LmInitPolicy::Disabled);
    }
}
