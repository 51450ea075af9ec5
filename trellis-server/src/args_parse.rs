use std::env;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    #[error("no arguments provided")]
    Empty,
    #[error("invalid server address '{0}': expected host:serverPort:clientPort:httpPort")]
    Address(String),
    #[error("unknown argument: {0}")]
    Unknown(String),
    #[error("-config requires a file")]
    MissingConfig,
    #[error("-bootstrap and -join are mutually exclusive")]
    Conflict,
    #[error("one of -bootstrap or -join is required")]
    NoMembership,
    #[error("-join requires at least one host:port")]
    EmptyJoin,
    #[error("invalid member address '{0}': expected host:port")]
    Member(String),
}

/// `host:serverPort:clientPort:httpPort`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    /// Raft peer transport.
    pub server_port: u16,
    /// WebSocket clients.
    pub client_port: u16,
    pub http_port: u16,
}

impl NodeAddress {
    pub fn parse(raw: &str) -> Result<Self, ArgsError> {
        let parts: Vec<&str> = raw.split(':').collect();
        let [host, server, client, http] = parts.as_slice() else {
            return Err(ArgsError::Address(raw.to_string()));
        };
        let port = |p: &str| p.parse::<u16>().map_err(|_| ArgsError::Address(raw.to_string()));
        if host.is_empty() {
            return Err(ArgsError::Address(raw.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            server_port: port(*server)?,
            client_port: port(*client)?,
            http_port: port(*http)?,
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.server_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// Initialize a cluster made of this server and the listed peers.
    Bootstrap(Vec<String>),
    /// Ask the listed members to add this server.
    Join(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub address: NodeAddress,
    pub membership: Membership,
    pub config_file: Option<String>,
}

impl Args {
    pub fn show_usage() {
        println!("Trellis Server Usage:");
        println!("  trellis-server host:serverPort:clientPort:httpPort [options]");
        println!("  -bootstrap [host:port ...]  Bootstrap a cluster with this server and the listed peers");
        println!("  -join host:port ...         Join an existing cluster through the listed members");
        println!("  -config file                YAML configuration file");
    }

    pub fn parse() -> Result<Self, ArgsError> {
        Self::parse_from(env::args().skip(1))
    }

    pub fn parse_from<I, S>(args: I) -> Result<Self, ArgsError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let mut iter = args.iter().peekable();

        let address = match iter.next() {
            Some(raw) if !raw.starts_with('-') => NodeAddress::parse(raw)?,
            Some(raw) => return Err(ArgsError::Address(raw.clone())),
            None => return Err(ArgsError::Empty),
        };

        let mut bootstrap: Option<Vec<String>> = None;
        let mut join: Option<Vec<String>> = None;
        let mut config_file = None;

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-bootstrap" | "-join" => {
                    let mut members = Vec::new();
                    while let Some(next) = iter.next_if(|a| !a.starts_with('-')) {
                        members.push(member(next)?);
                    }
                    let slot = if arg == "-bootstrap" {
                        &mut bootstrap
                    } else {
                        &mut join
                    };
                    slot.get_or_insert_with(Vec::new).extend(members);
                }
                "-config" => {
                    config_file = Some(
                        iter.next_if(|a| !a.starts_with('-'))
                            .ok_or(ArgsError::MissingConfig)?
                            .clone(),
                    );
                }
                other => return Err(ArgsError::Unknown(other.to_string())),
            }
        }

        let membership = match (bootstrap, join) {
            (Some(_), Some(_)) => return Err(ArgsError::Conflict),
            (Some(peers), None) => Membership::Bootstrap(peers),
            (None, Some(members)) if members.is_empty() => return Err(ArgsError::EmptyJoin),
            (None, Some(members)) => Membership::Join(members),
            (None, None) => return Err(ArgsError::NoMembership),
        };

        Ok(Args {
            address,
            membership,
            config_file,
        })
    }
}

fn member(raw: &str) -> Result<String, ArgsError> {
    match raw.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(raw.to_string()),
        _ => Err(ArgsError::Member(raw.to_string())),
    }
}
