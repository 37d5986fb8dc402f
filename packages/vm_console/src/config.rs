use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / vmconsole.toml / env vars)
// =============================================================================
//
//   vmconsole.toml:  [connect]
//                    timeout_secs = 60
//
//   env var:         VMCONSOLE_CONNECT__TIMEOUT_SECS=60   (double underscore = nesting)

pub const CONFIG_FILE_NAME: &str = "vmconsole.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub connect: ConnectFileConfig,
    #[serde(default)]
    pub batch: BatchFileConfig,
    #[serde(default)]
    pub socket: SocketFileConfig,
}

/// Connection tunables (lives under `[connect]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectFileConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_initial_ms")]
    pub poll_initial_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
}

impl Default for ConnectFileConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_connect_timeout_secs(),
            poll_initial_ms: default_poll_initial_ms(),
            poll_max_ms: default_poll_max_ms(),
        }
    }
}

/// Batch tunables (lives under `[batch]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchFileConfig {
    #[serde(default = "default_batch_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BatchFileConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_batch_timeout_secs(),
        }
    }
}

impl BatchFileConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Socket backend location (lives under `[socket]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SocketFileConfig {
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
}

impl Default for SocketFileConfig {
    fn default() -> Self {
        Self {
            run_dir: default_run_dir(),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_poll_initial_ms() -> u64 {
    100
}
fn default_poll_max_ms() -> u64 {
    2000
}
fn default_batch_timeout_secs() -> u64 {
    120
}
fn default_run_dir() -> PathBuf {
    PathBuf::from("/run/vmconsole")
}

/// Build a figment that layers: defaults → config file → VMCONSOLE_* env vars.
///
/// Without an explicit `path`, `vmconsole.toml` in the working directory is
/// used if present.
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let file = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed("VMCONSOLE_").split("__"))
}
