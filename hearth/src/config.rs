use crate::status::{Result, Status};
use serde_derive::Deserialize;
use sloggers::LoggerConfig;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::thread;

const DEFAULT_PID_PATH: &str = "log/hearth.pid";
const DEFAULT_LOCK_PATH: &str = "log/hearth.lock";

/// Server configuration, deserialized from TOML.
///
/// The `[log]` table is handed to `sloggers` untouched, so every sink and
/// level the logging stack understands is available from the same file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_pid_path")]
    pub pid_path: PathBuf,
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
    #[serde(default)]
    pub daemon: bool,
    pub version: Option<String>,
    #[serde(default = "default_worker_num")]
    pub worker_num: u32,
    #[serde(default = "default_true")]
    pub accept_turn: bool,
    #[serde(default)]
    pub schedule_turn: bool,
    #[serde(default = "default_true")]
    pub heartbeat_turn: bool,
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    #[serde(default = "default_keep_alive_cnt")]
    pub keep_alive_cnt: u8,
    pub log: Option<LoggerConfig>,

    #[serde(skip)]
    source: Option<PathBuf>,
}

fn default_protocol() -> String {
    "TCP".to_owned()
}

fn default_pid_path() -> PathBuf {
    PathBuf::from(DEFAULT_PID_PATH)
}

fn default_lock_path() -> PathBuf {
    PathBuf::from(DEFAULT_LOCK_PATH)
}

fn default_worker_num() -> u32 {
    thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_ms() -> u64 {
    crate::KEEP_ALIVE_MS
}

fn default_keep_alive_cnt() -> u8 {
    crate::KEEP_ALIVE_CNT
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: None,
            port: None,
            protocol: default_protocol(),
            pid_path: default_pid_path(),
            lock_path: default_lock_path(),
            daemon: false,
            version: None,
            worker_num: default_worker_num(),
            accept_turn: true,
            schedule_turn: false,
            heartbeat_turn: true,
            keep_alive_ms: default_keep_alive_ms(),
            keep_alive_cnt: default_keep_alive_cnt(),
            log: None,
            source: None,
        }
    }
}

impl Config {
    /// Parses a configuration file, remembering its path for `reload`.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let mut config: Config = serdeconv::from_toml_file(path.as_ref())
            .map_err(|err| Status::invalid_argument("config parse", err.to_string()))?;
        config.source = Some(path.as_ref().to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Config> {
        serdeconv::from_toml_str(toml)
            .map_err(|err| Status::invalid_argument("config parse", err.to_string()))
    }

    /// Re-reads the configuration from its original file. A configuration
    /// built in memory reloads to itself.
    pub fn reload(&mut self) -> Result<()> {
        if let Some(path) = self.source.clone() {
            *self = Config::from_toml_file(path)?;
        }
        Ok(())
    }

    /// Sets the name of the calling process as seen by `ps`/`top`.
    pub fn set_proc_title(&self, title: &str) -> Result<()> {
        let name = CString::new(title)
            .map_err(|err| Status::invalid_argument("proc title", err.to_string()))?;

        // Truncation past the kernel's 16-byte comm limit is silent.
        let rc = unsafe { nix::libc::prctl(nix::libc::PR_SET_NAME, name.as_ptr(), 0, 0, 0) };
        if rc == -1 {
            return Err(nix::errno::Errno::last().into());
        }
        Ok(())
    }
}
