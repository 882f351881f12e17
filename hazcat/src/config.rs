//! Transport configuration, loaded from TOML.
//!
//! Everything has a working default; a config file is only needed to move
//! the shared-memory namespace, tune the lock backoff, or point the device
//! backend somewhere specific.

use serde::Deserialize;
use shared::constants::{DEFAULT_DEPTH, DEFAULT_PREFIX};
use shared::errors::ConfigError;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Full transport configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Naming and queue defaults, `[transport]`
    pub transport: TransportConfig,
    /// Spin-lock tuning, `[lock]`
    pub lock: LockConfig,
    /// Device-backend tuning, `[device]`
    pub device: DeviceConfig,
}

/// `[transport]` section.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TransportConfig {
    /// Prefix of every shared-memory object this process creates or opens.
    /// Cooperating processes must agree on it.
    pub prefix: String,
    /// Ring depth for endpoints registering with depth 0.
    pub default_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            prefix: DEFAULT_PREFIX.to_owned(),
            default_depth: DEFAULT_DEPTH,
        }
    }
}

/// `[lock]` section.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LockConfig {
    /// Row spin-lock iterations before the backoff starts yielding.
    pub spin_limit: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig { spin_limit: 64 }
    }
}

/// `[device]` section.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    /// Allocation granularity of the emulated device backend, in bytes.
    pub granularity: usize,
    /// CUDA device ordinal used by `create_cuda_ring`.
    pub cuda_device: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            granularity: 256,
            cuda_device: 0,
        }
    }
}

impl Config {
    /// Load, parse, and validate a `Config` from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let cfg: Config = toml::from_str(&s).map_err(ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Resolve a config the usual way: `HAZCAT_CONFIG` env var, then
    /// `hazcat.toml` next to the executable, then built-in defaults.
    pub fn resolve() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os("HAZCAT_CONFIG") {
            return Self::load(&PathBuf::from(path));
        }
        let mut exe = env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
        exe.pop();
        exe.push("hazcat.toml");
        if exe.is_file() {
            return Self::load(&exe);
        }
        Ok(Config::default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.transport.prefix;
        if prefix.is_empty() {
            return Err(ConfigError::Validation(
                "transport.prefix must not be empty".into(),
            ));
        }
        if prefix.contains(['/', '.']) {
            return Err(ConfigError::Validation(format!(
                "transport.prefix `{prefix}` must not contain '/' or '.'"
            )));
        }
        if prefix.len() > 64 {
            return Err(ConfigError::Validation(
                "transport.prefix longer than 64 bytes leaves no room for topic names".into(),
            ));
        }
        if self.transport.default_depth == 0 || self.transport.default_depth > u16::MAX as usize {
            return Err(ConfigError::Validation(format!(
                "transport.default_depth must be in 1..={}",
                u16::MAX
            )));
        }
        if !self.device.granularity.is_power_of_two()
            || self.device.granularity < 64
            || self.device.granularity > 1 << 20
        {
            return Err(ConfigError::Validation(
                "device.granularity must be a power of two in 64..=1048576".into(),
            ));
        }
        if self.lock.spin_limit == 0 {
            return Err(ConfigError::Validation("lock.spin_limit must be > 0".into()));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn from_str(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(ConfigError::Parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[transport]
prefix        = "robot1"
default_depth = 16

[lock]
spin_limit = 128

[device]
granularity = 512
cuda_device = 1
"#;

    #[test]
    fn parse_full_config() {
        let cfg = Config::from_str(SAMPLE).expect("should parse full sample");
        assert_eq!(cfg.transport.prefix, "robot1");
        assert_eq!(cfg.transport.default_depth, 16);
        assert_eq!(cfg.lock.spin_limit, 128);
        assert_eq!(cfg.device.granularity, 512);
        assert_eq!(cfg.device.cuda_device, 1);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg = Config::from_str("[transport]\nprefix = \"x\"\n").unwrap();
        assert_eq!(cfg.transport.default_depth, DEFAULT_DEPTH);
        assert_eq!(cfg.lock.spin_limit, 64);
        assert_eq!(cfg.device.granularity, 256);
    }

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    fn load_str(toml: &str) -> Result<Config, ConfigError> {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(toml.as_bytes()).unwrap();
        Config::load(f.path())
    }

    #[test]
    fn dotted_prefix_is_rejected() {
        let err = load_str("[transport]\nprefix = \"a.b\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn zero_depth_is_rejected() {
        let err = load_str("[transport]\ndefault_depth = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn odd_granularity_is_rejected() {
        let err = load_str("[device]\ngranularity = 100\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn unknown_toml_is_a_parse_error() {
        let err = load_str("transport = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
