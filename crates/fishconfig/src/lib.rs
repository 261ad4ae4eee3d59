//! Redfish configuration file parser.
//!
//! The file is INI-style: flat keys live under `[mstor]` and `[ostor]`,
//! daemons are declared one section each as `[mds.N]` / `[osd.N]`:
//!
//! ```ini
//! [mstor]
//! mstor_path = /var/lib/redfish/mstor
//! min_repl = 3
//!
//! [mds.0]
//! host = 127.0.0.1
//! port = 9080
//! base_dir = /var/lib/redfish/mds0
//! ```
//!
//! Parsing yields a [`Config`]; the typed accessors apply defaults and
//! validation and hand back plain structs the subsystems consume. Epoch 1
//! of the cluster map is derived from the daemon sections.

use std::collections::HashMap;
use std::fs;
use std::net::{Ipv4Addr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use wire::{ClusterMap, DaemonInfo};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("missing required option: {0}")]
    MissingOption(String),

    #[error("invalid value for {key}: {reason}")]
    BadValue { key: String, reason: String },

    #[error("could not resolve host '{0}' to an IPv4 address")]
    Resolve(String),
}

/// Metadata store tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MstorConf {
    pub path: PathBuf,
    pub cache_mb: u64,
    pub io_threads: u32,
    pub create: bool,
    pub min_repl: u32,
    pub man_repl: u32,
}

/// Chunk store tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OstorConf {
    pub path: PathBuf,
    pub max_open: usize,
    /// Seconds an idle open chunk may keep its file descriptor.
    pub timeo_secs: u64,
}

/// One `[mds.N]` / `[osd.N]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonEntry {
    pub host: String,
    pub port: u16,
    pub base_dir: PathBuf,
}

/// A parsed configuration file.
#[derive(Debug, Clone)]
pub struct Config {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path)?;
        Config::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config, ConfigError> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = String::from("global");

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                current = line[1..line.len() - 1].trim().to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }
            match line.find('=') {
                Some(eq) => {
                    let key = line[..eq].trim().to_string();
                    let value = line[eq + 1..].trim().to_string();
                    sections.entry(current.clone()).or_default().insert(key, value);
                }
                None => {
                    return Err(ConfigError::Parse(format!(
                        "line is neither a section nor key = value: '{}'",
                        line
                    )))
                }
            }
        }
        Ok(Config { sections })
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(|v| v.as_str())
    }

    fn require(&self, section: &str, key: &str) -> Result<&str, ConfigError> {
        self.get(section, key)
            .ok_or_else(|| ConfigError::MissingOption(format!("{}.{}", section, key)))
    }

    fn get_u64(&self, section: &str, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.get(section, key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ConfigError::BadValue {
                key: format!("{}.{}", section, key),
                reason: format!("'{}' is not an integer", raw),
            }),
        }
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(section, key) {
            None => Ok(default),
            Some(raw) => match raw.to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(true),
                "false" | "no" | "0" | "off" => Ok(false),
                _ => Err(ConfigError::BadValue {
                    key: format!("{}.{}", section, key),
                    reason: format!("'{}' is not a boolean", raw),
                }),
            },
        }
    }

    /// Metadata store settings with defaults applied.
    pub fn mstor(&self) -> Result<MstorConf, ConfigError> {
        let mut cache_mb = self.get_u64("mstor", "mstor_cache_mb", 1024)?;
        // A 32-bit address space cannot absorb an arbitrarily large cache.
        if cfg!(target_pointer_width = "32") && cache_mb > 4096 {
            debug!(cache_mb, "capping mstor_cache_mb to 4096 on 32-bit");
            cache_mb = 4096;
        }
        let min_repl = self.get_u64("mstor", "min_repl", 3)? as u32;
        let man_repl = self.get_u64("mstor", "man_repl", 3)? as u32;
        if man_repl < min_repl {
            return Err(ConfigError::BadValue {
                key: "mstor.man_repl".to_string(),
                reason: format!("man_repl {} is below min_repl {}", man_repl, min_repl),
            });
        }
        Ok(MstorConf {
            path: PathBuf::from(self.require("mstor", "mstor_path")?),
            cache_mb,
            io_threads: self.get_u64("mstor", "mstor_io_threads", 16)? as u32,
            create: self.get_bool("mstor", "mstor_create", true)?,
            min_repl,
            man_repl,
        })
    }

    /// Chunk store settings.
    pub fn ostor(&self) -> Result<OstorConf, ConfigError> {
        let max_open = self.get_u64("ostor", "ostor_max_open", 128)? as usize;
        if max_open == 0 {
            return Err(ConfigError::BadValue {
                key: "ostor.ostor_max_open".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(OstorConf {
            path: PathBuf::from(self.require("ostor", "ostor_path")?),
            max_open,
            timeo_secs: self.get_u64("ostor", "ostor_timeo", 60)?,
        })
    }

    fn daemon_entries(&self, kind: &str) -> Result<Vec<DaemonEntry>, ConfigError> {
        let mut entries = Vec::new();
        for idx in 0.. {
            let section = format!("{}.{}", kind, idx);
            if !self.sections.contains_key(&section) {
                break;
            }
            let port: u16 = self
                .require(&section, "port")?
                .parse()
                .map_err(|_| ConfigError::BadValue {
                    key: format!("{}.port", section),
                    reason: "not a port number".to_string(),
                })?;
            entries.push(DaemonEntry {
                host: self.require(&section, "host")?.to_string(),
                port,
                base_dir: PathBuf::from(self.require(&section, "base_dir")?),
            });
        }
        if entries.is_empty() {
            return Err(ConfigError::MissingOption(format!("{}.0", kind)));
        }
        Ok(entries)
    }

    pub fn mds_entries(&self) -> Result<Vec<DaemonEntry>, ConfigError> {
        self.daemon_entries("mds")
    }

    pub fn osd_entries(&self) -> Result<Vec<DaemonEntry>, ConfigError> {
        self.daemon_entries("osd")
    }

    /// Build epoch 1 of the cluster map from the daemon sections.
    pub fn cluster_map(&self) -> Result<ClusterMap, ConfigError> {
        let osds = self
            .osd_entries()?
            .iter()
            .map(|e| Ok(DaemonInfo::new(resolve_ipv4(&e.host)?, e.port)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let mdses = self
            .mds_entries()?
            .iter()
            .map(|e| Ok(DaemonInfo::new(resolve_ipv4(&e.host)?, e.port)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(ClusterMap::new(1, osds, mdses))
    }
}

/// First IPv4 address a host name resolves to, as a host-order `u32`.
pub fn resolve_ipv4(host: &str) -> Result<u32, ConfigError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(u32::from(ip));
    }
    let addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|_| ConfigError::Resolve(host.to_string()))?;
    for addr in addrs {
        if let std::net::IpAddr::V4(v4) = addr.ip() {
            return Ok(u32::from(v4));
        }
    }
    Err(ConfigError::Resolve(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# redfish test cluster
[mstor]
mstor_path = /data/mstor
mstor_cache_mb = 512

[ostor]
ostor_path = /data/ostor
ostor_max_open = 64
ostor_timeo = 30

[mds.0]
host = 127.0.0.1
port = 9080
base_dir = /data/mds0

[mds.1]
host = 127.0.0.1
port = 9081
base_dir = /data/mds1

[osd.0]
host = 127.0.0.1
port = 8080
base_dir = /data/osd0
"#;

    #[test]
    fn parses_sections_and_defaults() {
        let conf = Config::parse(SAMPLE).unwrap();
        let mstor = conf.mstor().unwrap();
        assert_eq!(mstor.path, PathBuf::from("/data/mstor"));
        assert_eq!(mstor.cache_mb, 512);
        assert_eq!(mstor.io_threads, 16);
        assert!(mstor.create);
        assert_eq!((mstor.min_repl, mstor.man_repl), (3, 3));

        let ostor = conf.ostor().unwrap();
        assert_eq!(ostor.max_open, 64);
        assert_eq!(ostor.timeo_secs, 30);
    }

    #[test]
    fn daemon_arrays_stop_at_first_gap() {
        let conf = Config::parse(SAMPLE).unwrap();
        let mdses = conf.mds_entries().unwrap();
        assert_eq!(mdses.len(), 2);
        assert_eq!(mdses[1].port, 9081);
        assert_eq!(conf.osd_entries().unwrap().len(), 1);
    }

    #[test]
    fn man_repl_below_min_repl_rejected() {
        let bad = format!("{}\n[mstor]\nman_repl = 2\nmin_repl = 3\n", SAMPLE);
        // Re-parse with the overriding keys appended under [mstor].
        let conf = Config::parse(&bad).unwrap();
        assert!(matches!(
            conf.mstor(),
            Err(ConfigError::BadValue { .. })
        ));
    }

    #[test]
    fn cluster_map_is_epoch_one() {
        let conf = Config::parse(SAMPLE).unwrap();
        let cmap = conf.cluster_map().unwrap();
        assert_eq!(cmap.epoch, 1);
        assert_eq!(cmap.num_mds(), 2);
        assert_eq!(cmap.num_osd(), 1);
        assert_eq!(cmap.mdses[0].ip, u32::from(Ipv4Addr::LOCALHOST));
        assert!(cmap.mdses.iter().all(|m| m.is_in));
    }

    #[test]
    fn junk_line_is_an_error() {
        assert!(Config::parse("not a key value line").is_err());
    }
}
