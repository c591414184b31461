use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding index.html and the bootstrap stylesheet.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

/// Where frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Spawn an encoder process and read MJPEG from its stdout.
    Command,
    /// Relay an upstream multipart MJPEG HTTP stream.
    Mjpeg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_source")]
    pub source: SourceMode,
    /// `WIDTHxHEIGHT`, e.g. `800x600`.
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    #[serde(default = "default_program")]
    pub program: String,
    /// Overrides the default encoder arguments. `{width}`, `{height}` and
    /// `{framerate}` are substituted.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_url")]
    pub url: String,
    /// Multipart boundary of the upstream stream, without the leading `--`.
    #[serde(default = "default_boundary")]
    pub boundary: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            static_dir: default_static_dir(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            resolution: default_resolution(),
            framerate: default_framerate(),
            program: default_program(),
            args: None,
            read_chunk_size: default_read_chunk_size(),
            url: default_url(),
            boundary: default_boundary(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.camera.dimensions()?;
        if self.camera.framerate == 0 {
            return Err(ConfigError::Invalid("camera.framerate must be positive".into()));
        }
        if self.camera.read_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "camera.read_chunk_size must be positive".into(),
            ));
        }
        if self.camera.boundary.is_empty() {
            return Err(ConfigError::Invalid("camera.boundary must not be empty".into()));
        }
        Ok(())
    }

    /// Socket address string the HTTP server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

impl CameraConfig {
    /// Parse `resolution` into `(width, height)`.
    pub fn dimensions(&self) -> Result<(u32, u32), ConfigError> {
        let invalid = || ConfigError::Invalid(format!("bad resolution {:?}", self.resolution));
        let (w, h) = self
            .resolution
            .trim()
            .split_once(|c: char| c == 'x' || c == 'X')
            .ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok((width, height))
    }

    /// Arguments for the encoder process, with placeholders filled in.
    pub fn encoder_args(&self) -> Result<Vec<String>, ConfigError> {
        let (width, height) = self.dimensions()?;
        let args = self.args.clone().unwrap_or_else(default_encoder_args);
        Ok(args
            .iter()
            .map(|arg| {
                arg.replace("{width}", &width.to_string())
                    .replace("{height}", &height.to_string())
                    .replace("{framerate}", &self.framerate.to_string())
            })
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8000
}
fn default_static_dir() -> PathBuf {
    PathBuf::from("html")
}
fn default_source() -> SourceMode {
    SourceMode::Command
}
fn default_resolution() -> String {
    "800x600".into()
}
fn default_framerate() -> u32 {
    24
}
fn default_program() -> String {
    "libcamera-vid".into()
}
fn default_encoder_args() -> Vec<String> {
    [
        "--nopreview",
        "-t",
        "0",
        "--codec",
        "mjpeg",
        "--width",
        "{width}",
        "--height",
        "{height}",
        "--framerate",
        "{framerate}",
        "-o",
        "-",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_read_chunk_size() -> usize {
    64 * 1024
}
fn default_url() -> String {
    "http://127.0.0.1:8080/stream.mjpg".into()
}
fn default_boundary() -> String {
    "FRAME".into()
}
fn default_log_level() -> String {
    "info".into()
}
