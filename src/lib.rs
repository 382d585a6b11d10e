pub mod cli;
pub mod collection;
pub mod command;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod pool;
pub mod protocol;

pub use cli::prompt;
pub use collection::{Collection, FindOptions, UpdateOptions, WriteOptions};
pub use command::{Command, CommandError};
pub use config::{ClientOptions, ConfigError, HostAddr};
pub use connection::{Connection, ConnectionState, PendingReply};
pub use database::Database;
pub use error::{DatabaseError, Error, InterfaceError, Result};
pub use pool::ConnectionPool;
pub use protocol::{Operation, Reply, WriteConcern};
