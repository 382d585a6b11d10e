//! Client configuration.
//!
//! [`ClientOptions`] carries everything the pool and the database handle need:
//! the ordered host list, the active database name and the per-connection
//! knobs. Hosts are written as `host:port`; the port defaults to
//! [`DEFAULT_PORT`] when omitted.
use std::{fmt, str::FromStr, time::Duration};

use thiserror::Error;

use crate::protocol::WriteConcern;

pub const DEFAULT_PORT: u16 = 27017;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid host '{host}': {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("no hosts configured")]
    NoHosts,

    #[error("invalid database name '{0}'")]
    InvalidDatabaseName(String),

    #[error("connections_per_host must be at least 1")]
    NoConnections,
}

/// One `host:port` entry of the server list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: &str| ConfigError::InvalidHost {
            host: s.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid("port must be an integer between 0 and 65535"))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(invalid("host name is empty"));
        }

        Ok(HostAddr::new(host, port))
    }
}

/// Settings shared by the pool, its connections and the collection facade.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub hosts: Vec<HostAddr>,
    pub dbname: String,
    /// Reopen a closed socket before the next send instead of failing it.
    pub autoreconnect: bool,
    pub connections_per_host: usize,
    pub connect_timeout: Duration,
    /// Reject document keys starting with `$` or containing `.` on writes.
    pub check_keys: bool,
    pub write_concern: WriteConcern,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            hosts: vec![HostAddr::new("localhost", DEFAULT_PORT)],
            dbname: "test".to_string(),
            autoreconnect: true,
            connections_per_host: 1,
            connect_timeout: Duration::from_secs(5),
            check_keys: true,
            write_concern: WriteConcern::Acknowledged,
        }
    }
}

impl ClientOptions {
    /// Build options from `host:port` strings and a database name.
    pub fn new<I, S>(hosts: I, dbname: impl Into<String>) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .map(|h| h.as_ref().parse())
            .collect::<Result<Vec<HostAddr>, _>>()?;

        let options = Self {
            hosts,
            dbname: dbname.into(),
            ..Default::default()
        };
        options.validate()?;
        Ok(options)
    }

    pub fn with_autoreconnect(mut self, autoreconnect: bool) -> Self {
        self.autoreconnect = autoreconnect;
        self
    }

    pub fn with_connections_per_host(mut self, connections: usize) -> Self {
        self.connections_per_host = connections;
        self
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }
        if self.connections_per_host == 0 {
            return Err(ConfigError::NoConnections);
        }
        if self.dbname.is_empty()
            || self
                .dbname
                .chars()
                .any(|c| matches!(c, '.' | ' ' | '$' | '/' | '\\' | '\0'))
        {
            return Err(ConfigError::InvalidDatabaseName(self.dbname.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_from_string() {
        let inputs = vec![
            ("localhost:27027", HostAddr::new("localhost", 27027)),
            ("db.internal", HostAddr::new("db.internal", DEFAULT_PORT)),
            (" 10.0.0.1:1 ", HostAddr::new("10.0.0.1", 1)),
        ];

        for (s, expected) in inputs {
            let host: HostAddr = s.parse().unwrap();
            assert_eq!(host, expected);
        }
    }

    #[test]
    #[should_panic(expected = "InvalidHost")]
    fn host_with_bad_port() {
        let _: HostAddr = "localhost:abc".parse().unwrap();
    }

    #[test]
    fn host_display_round_trips() {
        let host = HostAddr::new("localhost", 27028);
        assert_eq!(host.to_string().parse::<HostAddr>().unwrap(), host);
    }

    #[test]
    fn options_require_hosts() {
        let hosts: Vec<&str> = vec![];
        assert_eq!(
            ClientOptions::new(hosts, "test").unwrap_err(),
            ConfigError::NoHosts
        );
    }

    #[test]
    fn options_reject_dotted_database_name() {
        assert!(matches!(
            ClientOptions::new(["localhost"], "a.b"),
            Err(ConfigError::InvalidDatabaseName(_))
        ));
    }

    #[test]
    fn options_defaults() {
        let options = ClientOptions::new(["localhost:27027", "localhost:27028"], "test").unwrap();

        assert_eq!(options.hosts.len(), 2);
        assert!(options.autoreconnect);
        assert!(options.check_keys);
        assert_eq!(options.connections_per_host, 1);
        assert_eq!(options.write_concern, WriteConcern::Acknowledged);
    }
}
