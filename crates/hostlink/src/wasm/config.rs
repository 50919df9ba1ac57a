//! Configuration for the bridge sandbox.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};
use crate::host::ViewportConfig;

/// Default import module the capability table is registered under.
pub const DEFAULT_IMPORT_MODULE: &str = "hostlink";

/// WASI grants for guests that also import `wasi_snapshot_preview1`.
///
/// Everything starts denied; the bridge itself needs none of these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasiCapabilities {
    /// Inherit stdout
    pub stdout: bool,

    /// Inherit stderr
    pub stderr: bool,

    /// Directories to pre-open read-only
    pub preopened_dirs_ro: Vec<PathBuf>,

    /// Environment variables to expose
    pub env_vars: Vec<(String, String)>,

    /// Command-line arguments to pass
    pub args: Vec<String>,
}

impl WasiCapabilities {
    /// Nothing allowed.
    pub fn none() -> Self {
        Self::default()
    }

    /// stdout and stderr inherited, so guest panics are visible.
    pub fn with_stdio() -> Self {
        Self {
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }

    /// Builder: inherit stdout
    pub fn stdout(mut self, allow: bool) -> Self {
        self.stdout = allow;
        self
    }

    /// Builder: inherit stderr
    pub fn stderr(mut self, allow: bool) -> Self {
        self.stderr = allow;
        self
    }

    /// Builder: add read-only directory
    pub fn preopened_dir_ro(mut self, path: impl Into<PathBuf>) -> Self {
        self.preopened_dirs_ro.push(path.into());
        self
    }

    /// Builder: add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Builder: add command-line argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Configuration for [`super::WasmSandbox`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmConfig {
    /// Module name the guest imports host capabilities from
    pub import_module: String,

    /// Link `wasi_snapshot_preview1` alongside the capability table
    pub link_wasi: bool,

    /// WASI grants, used when `link_wasi` is set
    pub capabilities: WasiCapabilities,

    /// Maximum linear memory in bytes
    pub max_memory: usize,

    /// Fuel budget per instance (`None` = unmetered)
    pub fuel_limit: Option<u64>,

    /// Cranelift optimization level (0-2)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,

    /// Viewport reported by the headless host
    pub viewport: ViewportConfig,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            import_module: DEFAULT_IMPORT_MODULE.to_string(),
            link_wasi: false,
            capabilities: WasiCapabilities::none(),
            max_memory: 256 * 1024 * 1024, // 256 MB
            fuel_limit: None,
            optimization_level: 2,
            enable_simd: true,
            viewport: ViewportConfig::default(),
        }
    }
}

impl WasmConfig {
    /// Tight limits for untrusted guests.
    pub fn minimal() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024,    // 64 MB
            fuel_limit: Some(1_000_000_000), // 1B fuel units
            ..Default::default()
        }
    }

    /// Fast compilation and WASI stdio for debugging guests.
    pub fn development() -> Self {
        Self {
            link_wasi: true,
            capabilities: WasiCapabilities::with_stdio(),
            optimization_level: 0,
            ..Default::default()
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| BridgeError::ConfigError(format!("{}: {}", path.display(), e)))
    }

    /// Parse a config from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.import_module.is_empty() {
            return Err(BridgeError::ConfigError("import_module must not be empty".into()));
        }
        if self.import_module == "wasi_snapshot_preview1" {
            return Err(BridgeError::ConfigError(
                "import_module collides with the WASI module name".into(),
            ));
        }
        if self.max_memory == 0 {
            return Err(BridgeError::ConfigError("max_memory must be non-zero".into()));
        }
        Ok(())
    }

    /// Builder: set import module name
    pub fn import_module(mut self, name: impl Into<String>) -> Self {
        self.import_module = name.into();
        self
    }

    /// Builder: link WASI with the given grants
    pub fn wasi(mut self, caps: WasiCapabilities) -> Self {
        self.link_wasi = true;
        self.capabilities = caps;
        self
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: enable SIMD
    pub fn simd(mut self, enable: bool) -> Self {
        self.enable_simd = enable;
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(2);
        self
    }

    /// Builder: set viewport
    pub fn viewport(mut self, viewport: ViewportConfig) -> Self {
        self.viewport = viewport;
        self
    }
}
