use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use trellis_raft::node::LogStorage;

use crate::args_parse::{Args, Membership};

/// configuration settings loaded from the config file
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfiguration {
    /// Trellis cluster name
    pub cluster_name: String,
    pub session: SessionConfig,
    pub raft: RaftConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session timeout used when a client does not ask for one
    pub default_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Disk,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Directory of the on-disk log
    pub data_dir: PathBuf,
    pub storage: StorageKind,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Build a snapshot after this many entries
    pub snapshot_logs_since_last: u64,
    /// How often the leader moves log time forward
    pub tick_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            storage: StorageKind::Memory,
            heartbeat_interval_ms: 250,
            election_timeout_min_ms: 1_000,
            election_timeout_max_ms: 2_000,
            snapshot_logs_since_last: 1_000,
            tick_interval_ms: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Deadline for a proposal to be applied
    pub request_timeout_ms: u64,
    /// Upper bound of an events long-poll
    pub event_poll_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            event_poll_timeout_ms: 30_000,
        }
    }
}

/// runtime settings of a Trellis server, after merging the command line
#[derive(Debug)]
pub struct ServiceConfiguration {
    pub cluster_name: String,
    /// Raft peer transport bind address
    pub raft_addr: SocketAddr,
    /// `host:serverPort` as given on the command line, used as node identity
    pub advertised_addr: String,
    /// WebSocket client address
    pub client_addr: SocketAddr,
    /// HTTP/JSON address
    pub http_addr: SocketAddr,
    pub membership: Membership,
    pub data_dir: PathBuf,
    pub storage: LogStorage,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub snapshot_logs_since_last: u64,
    pub tick_interval: Duration,
    pub request_timeout: Duration,
    pub event_poll_timeout: Duration,
    pub default_session_timeout_ms: u64,
}

impl LoadConfiguration {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse configuration")
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}:{}", host, port))?
        .next()
        .ok_or_else(|| anyhow!("{}:{} resolves to no address", host, port))
}

/// Implementing the TryFrom trait to merge the command line into the loaded configuration
impl TryFrom<(Args, LoadConfiguration)> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from((args, config): (Args, LoadConfiguration)) -> Result<Self> {
        let address = args.address;
        let raft_addr = resolve(&address.host, address.server_port)?;
        let client_addr = resolve(&address.host, address.client_port)?;
        let http_addr = resolve(&address.host, address.http_port)?;

        if config.raft.election_timeout_min_ms >= config.raft.election_timeout_max_ms {
            return Err(anyhow!(
                "raft.election_timeout_min_ms must be below raft.election_timeout_max_ms"
            ));
        }

        let cluster_name = if config.cluster_name.is_empty() {
            "trellis".to_string()
        } else {
            config.cluster_name
        };

        Ok(ServiceConfiguration {
            cluster_name,
            raft_addr,
            advertised_addr: address.server_addr(),
            client_addr,
            http_addr,
            membership: args.membership,
            data_dir: config.raft.data_dir,
            storage: match config.raft.storage {
                StorageKind::Memory => LogStorage::Memory,
                StorageKind::Disk => LogStorage::Disk,
            },
            heartbeat_interval: Duration::from_millis(config.raft.heartbeat_interval_ms),
            election_timeout_min: Duration::from_millis(config.raft.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(config.raft.election_timeout_max_ms),
            snapshot_logs_since_last: config.raft.snapshot_logs_since_last,
            tick_interval: Duration::from_millis(config.raft.tick_interval_ms),
            request_timeout: Duration::from_millis(config.http.request_timeout_ms),
            event_poll_timeout: Duration::from_millis(config.http.event_poll_timeout_ms),
            default_session_timeout_ms: config.session.default_timeout_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args::parse_from(["127.0.0.1:7000:7001:7002", "-bootstrap"]).unwrap()
    }

    #[test]
    fn empty_file_means_defaults() {
        let load = LoadConfiguration::from_yaml("{}").unwrap();
        let cfg = ServiceConfiguration::try_from((args(), load)).unwrap();
        assert_eq!(cfg.cluster_name, "trellis");
        assert_eq!(cfg.raft_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(cfg.client_addr.port(), 7001);
        assert_eq!(cfg.http_addr.port(), 7002);
        assert_eq!(cfg.advertised_addr, "127.0.0.1:7000");
        assert_eq!(cfg.storage, LogStorage::Memory);
        assert_eq!(cfg.tick_interval, Duration::from_millis(100));
        assert_eq!(cfg.default_session_timeout_ms, 5_000);
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let yaml = r#"
cluster_name: prod
raft:
  storage: disk
  data_dir: /var/lib/trellis
  tick_interval_ms: 20
http:
  request_timeout_ms: 900
"#;
        let load = LoadConfiguration::from_yaml(yaml).unwrap();
        let cfg = ServiceConfiguration::try_from((args(), load)).unwrap();
        assert_eq!(cfg.cluster_name, "prod");
        assert_eq!(cfg.storage, LogStorage::Disk);
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/trellis"));
        assert_eq!(cfg.tick_interval, Duration::from_millis(20));
        assert_eq!(cfg.request_timeout, Duration::from_millis(900));
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(cfg.event_poll_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn rejects_inverted_election_timeouts() {
        let yaml = "raft:\n  election_timeout_min_ms: 3000\n  election_timeout_max_ms: 2000\n";
        let load = LoadConfiguration::from_yaml(yaml).unwrap();
        assert!(ServiceConfiguration::try_from((args(), load)).is_err());
    }
}
