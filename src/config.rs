use log::LevelFilter;

use toml;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use error::{Error, Result};

/// Which idle connection scheduler to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    /// Binary min-heap with exact ordering.
    Heap,
    /// Approximate circular list, swept on a fixed cadence.
    #[serde(alias = "approximate")]
    Wheel,
}

/// Edge or level triggering for the listener and for client connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMode {
    pub listener_edge: bool,
    pub connection_edge: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    /// 0: level/level, 1: edge connections, 2: edge listener, 3: edge/edge.
    pub trigger_mode: u8,
    pub timer: TimerKind,
    /// Idle timeout for connections. 0 turns eviction off.
    pub timeout_ms: u64,
    pub wheel_cadence_ms: u64,
    pub linger: bool,
    pub workers: usize,
    pub max_connections: usize,
    pub events_capacity: usize,
    pub root_dir: PathBuf,
    pub credentials: CredentialConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// File the user table is loaded from and saved to. Kept in memory only when absent.
    pub path: Option<PathBuf>,
    /// Number of callers allowed into the store at once.
    pub pool_size: usize,
    pub bcrypt_cost: u32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    pub level: String,
    /// Lines queued for the writer thread. 0 logs synchronously to stdout.
    pub queue_depth: usize,
    pub dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 1316,
            trigger_mode: 3,
            timer: TimerKind::Heap,
            timeout_ms: 60_000,
            wheel_cadence_ms: 500,
            linger: false,
            workers: 6,
            max_connections: 65_536,
            events_capacity: 1024,
            root_dir: PathBuf::from("./resources"),
            credentials: CredentialConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        CredentialConfig {
            path: None,
            pool_size: 12,
            bcrypt_cost: 10,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            enabled: true,
            level: "info".to_owned(),
            queue_depth: 1024,
            dir: PathBuf::from("./log"),
        }
    }
}

impl Config {
    /// Read and validate a config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        let config: Config = toml::from_slice(&buffer[..])?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a config from a string.
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: Config = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port < 1024 {
            return Err(Error::Config(format!(
                "port {} is outside 1024-65535",
                self.port
            )));
        }
        if self.trigger_mode > 3 {
            return Err(Error::Config(format!(
                "trigger mode {} is outside 0-3",
                self.trigger_mode
            )));
        }
        if self.workers == 0 {
            return Err(Error::Config("at least one worker is needed".to_owned()));
        }
        if self.events_capacity == 0 {
            return Err(Error::Config("events capacity must be positive".to_owned()));
        }
        if self.timer == TimerKind::Wheel && self.timeout_ms > 0 && self.wheel_cadence_ms == 0 {
            return Err(Error::Config("wheel cadence must be positive".to_owned()));
        }
        if self.credentials.pool_size == 0 {
            return Err(Error::Config("credential pool size must be positive".to_owned()));
        }
        self.log.level_filter()?;
        Ok(())
    }

    pub fn trigger(&self) -> TriggerMode {
        TriggerMode {
            listener_edge: self.trigger_mode >= 2,
            connection_edge: self.trigger_mode % 2 == 1,
        }
    }
}

impl LogConfig {
    pub fn level_filter(&self) -> Result<LevelFilter> {
        self.level
            .parse()
            .map_err(|_| Error::Config(format!("unknown log level {:?}", self.level)))
    }
}
