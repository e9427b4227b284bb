use anyhow::{Context, Result};
use facematch_vision::{model, PipelineOptions};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::assets;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEMATCH_CONFIG_PATH").unwrap_or("/usr/local/etc/facematch/config.toml"))
});

/// Where the ONNX models live unless the config says otherwise.
pub static MODEL_DIR: Lazy<PathBuf> = Lazy::new(|| {
    directories::ProjectDirs::from("", "", "facematch")
        .map(|dirs| dirs.data_dir().join("models"))
        .unwrap_or_else(|| PathBuf::from("models"))
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    /// Match threshold used when a compare request does not carry one.
    pub threshold: f64,
    pub extract_timeout_secs: u64,
    pub max_upload_mb: usize,
    pub enable_cors: bool,
    pub models: ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    /// Downloaded into `detector` when that file is missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detector_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recognizer_url: Option<String>,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub normalize: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5001".to_string(),
            threshold: 10.0,
            extract_timeout_secs: 30,
            max_upload_mb: 10,
            enable_cors: true,
            models: ModelConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        let opts = PipelineOptions::default();
        Self {
            detector: MODEL_DIR.join(model::DETECTOR_FILE),
            recognizer: MODEL_DIR.join(model::RECOGNIZER_FILE),
            detector_url: Some(assets::DETECTOR_URL.to_string()),
            recognizer_url: Some(assets::RECOGNIZER_URL.to_string()),
            score_threshold: opts.score_threshold,
            nms_threshold: opts.nms_threshold,
            normalize: opts.normalize,
        }
    }
}

impl Config {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("invalid bind address {:?}", self.bind))
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

impl ModelConfig {
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            score_threshold: self.score_threshold,
            nms_threshold: self.nms_threshold,
            normalize: self.normalize,
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        log::debug!("no config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn to_toml(cfg: &Config) -> Result<String> {
    Ok(toml::to_string_pretty(cfg)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.threshold, 10.0);
        assert_eq!(cfg.extract_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.max_upload_bytes(), 10 * 1024 * 1024);
        assert_eq!(cfg.socket_addr().unwrap().port(), 5001);
        assert!(cfg.models.detector.ends_with(model::DETECTOR_FILE));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(Some(dir.path().join("absent.toml").as_path())).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "threshold = 0.8\nbind = \"127.0.0.1:9000\"\n\n[models]\nnormalize = true"
        )
        .unwrap();

        let cfg = load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.threshold, 0.8);
        assert_eq!(cfg.bind, "127.0.0.1:9000");
        assert!(cfg.models.normalize);
        assert_eq!(cfg.models.nms_threshold, 0.3);
        assert_eq!(cfg.extract_timeout_secs, 30);
    }

    #[test]
    fn bad_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "threshold = \"strict\"").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("parsing config"));
    }

    #[test]
    fn printed_config_parses_back() {
        let cfg = Config::default();
        let text = to_toml(&cfg).unwrap();
        assert_eq!(toml::from_str::<Config>(&text).unwrap(), cfg);
    }

    #[test]
    fn huge_upload_limit_saturates() {
        let cfg = Config {
            max_upload_mb: usize::MAX / 2,
            ..Config::default()
        };
        assert_eq!(cfg.max_upload_bytes(), usize::MAX);
    }

    #[test]
    fn model_urls_are_configurable() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[models]\ndetector_url = \"http://mirror.local/yunet.onnx\"").unwrap();

        let cfg = load_config(Some(file.path())).unwrap();
        assert_eq!(
            cfg.models.detector_url.as_deref(),
            Some("http://mirror.local/yunet.onnx")
        );
        assert_eq!(cfg.models.recognizer_url.as_deref(), Some(assets::RECOGNIZER_URL));

        let offline = ModelConfig {
            detector_url: None,
            ..cfg.models
        };
        assert!(!to_toml(&Config { models: offline, ..Config::default() })
            .unwrap()
            .contains("detector_url"));
    }

    #[test]
    fn invalid_bind_address() {
        let cfg = Config {
            bind: "not an address".into(),
            ..Config::default()
        };
        assert!(cfg.socket_addr().is_err());
    }
}
