//! Collector configuration.
//!
//! The privileged monitor owns the configuration file; the collector only
//! ever sees the parsed [`Config`], either at startup or streamed over the
//! control channel on reconfigure. The file format is TOML:
//!
//! ```toml
//! log_file = "/var/log/flowlogd/flows.log"
//! listen_on = ["0.0.0.0:2055", "[::]:2055"]
//! max_peers = 128
//! store = ["src_addr", "dst_addr", "octets", "packets", "recv_time"]
//!
//! [[filter]]
//! action = "discard"
//! match = { protocol = 17, dst_port = 53 }
//! ```
//!
//! `-D KEY=VALUE` command-line defines substitute `${KEY}` occurrences in
//! the file text before parsing.

use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::filter::FilterRule;
use crate::flow::field;

/// Where the daemon looks when `-f` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/flowlogd.conf";

/// Peer-table bound when the file does not set one.
pub const DEFAULT_MAX_PEERS: usize = 128;

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, io::Error),
    Parse(toml::de::Error),
    /// `-D` argument without a `KEY=VALUE` shape.
    BadDefine(String),
    /// `store` lists a field name the log format does not define.
    UnknownStoreField(String),
    NoListenAddrs,
    BadMaxPeers,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => {
                write!(f, "cannot read config {}: {}", path.display(), e)
            }
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
            ConfigError::BadDefine(d) => {
                write!(f, "macro definition {:?} is not KEY=VALUE", d)
            }
            ConfigError::UnknownStoreField(name) => {
                write!(f, "unknown store field {:?}", name)
            }
            ConfigError::NoListenAddrs => f.write_str("no listen_on addresses configured"),
            ConfigError::BadMaxPeers => f.write_str("max_peers must be nonzero"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(_, e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

/// Everything the collector needs to run. Serializable both ways because
/// the monitor streams it back over the control channel on reconfigure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Flow log path, opened by the monitor.
    pub log_file: PathBuf,
    /// UDP addresses to receive NetFlow on.
    pub listen_on: Vec<SocketAddr>,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// Field names to persist; omitted means everything.
    #[serde(default)]
    pub store: Option<Vec<String>>,
    /// Ordered filter rules.
    #[serde(default, rename = "filter")]
    pub filters: Vec<FilterRule>,
}

fn default_max_peers() -> usize {
    DEFAULT_MAX_PEERS
}

impl Config {
    /// Read and parse a configuration file, applying macro defines first.
    pub fn load(path: &Path, defines: &[(String, String)]) -> Result<Config, ConfigError> {
        let mut text =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        for (key, value) in defines {
            text = text.replace(&format!("${{{}}}", key), value);
        }
        let config: Config = toml::from_str(&text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_on.is_empty() {
            return Err(ConfigError::NoListenAddrs);
        }
        if self.max_peers == 0 {
            return Err(ConfigError::BadMaxPeers);
        }
        if let Some(names) = &self.store {
            for name in names {
                if field::from_name(name).is_none() {
                    return Err(ConfigError::UnknownStoreField(name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Serialization mask derived from the `store` list.
    ///
    /// The record header (fields + tag) is always written, so the TAG bit
    /// is implied.
    pub fn store_mask(&self) -> u32 {
        match &self.store {
            None => field::ALL,
            Some(names) => names
                .iter()
                .filter_map(|n| field::from_name(n))
                .fold(field::TAG, |mask, bit| mask | bit),
        }
    }
}

/// Split a `-D KEY=VALUE` argument.
pub fn parse_define(arg: &str) -> Result<(String, String), ConfigError> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(ConfigError::BadDefine(arg.to_string())),
    }
}
