//! The process-facing entry point of the driver.
//!
//! A [`Database`] is an explicit handle: it starts uninitialized, becomes live
//! with [`Database::init`] and goes back to uninitialized with
//! [`Database::disconnect`]. Clones share one lifecycle, so a handle can be
//! passed to as many tasks as needed and re-pointed at a new server list from
//! any of them. Every operation on a handle that is not live fails fast with
//! [`DatabaseError::NotInitialized`].
use std::sync::{Arc, PoisonError, RwLock};

use bson::Document;
use log::info;

use crate::{
    collection::Collection,
    config::ClientOptions,
    error::{DatabaseError, Result},
    pool::ConnectionPool,
    protocol::{Operation, Reply, get_int, is_ok},
};

#[derive(Clone, Default)]
pub struct Database {
    live: Arc<RwLock<Option<Live>>>,
}

#[derive(Clone)]
struct Live {
    pool: Arc<ConnectionPool>,
    dbname: String,
}

impl Database {
    /// An uninitialized handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize a fresh handle from `host:port` strings.
    pub async fn connect<I, S>(hosts: I, dbname: &str) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let database = Self::new();
        database.init(ClientOptions::new(hosts, dbname)?).await?;
        Ok(database)
    }

    /// Make the handle live. A previously live pool is closed and replaced.
    pub async fn init(&self, options: ClientOptions) -> Result<()> {
        let dbname = options.dbname.clone();
        let pool = Arc::new(ConnectionPool::new(options)?);
        info!("database '{dbname}' initialized with {} host(s)", pool.hosts().len());

        let previous = self.write().replace(Live { pool, dbname });
        if let Some(previous) = previous {
            previous.pool.close().await;
        }
        Ok(())
    }

    /// Close every pooled connection. The handle must be initialized again before use.
    pub async fn disconnect(&self) {
        let previous = self.write().take();
        if let Some(previous) = previous {
            previous.pool.close().await;
            info!("database '{}' disconnected", previous.dbname);
        }
    }

    pub fn is_live(&self) -> bool {
        self.read().is_some()
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.live()?.dbname)
    }

    pub fn pool(&self) -> Result<Arc<ConnectionPool>> {
        Ok(self.live()?.pool)
    }

    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.clone(), name)
    }

    /// Run a command against this database and return its reply document.
    ///
    /// A reply with `ok` other than 1 is a [`DatabaseError::Command`].
    pub async fn command(&self, command: Document) -> Result<Document> {
        let live = self.live()?;
        let reply = live
            .pool
            .send(Operation::command(live.dbname, command))
            .await?;
        command_result(reply)
    }

    fn live(&self) -> Result<Live> {
        self.read()
            .clone()
            .ok_or_else(|| DatabaseError::NotInitialized.into())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<Live>> {
        self.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Live>> {
        self.live.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The single document of a command reply, checked for `ok`.
fn command_result(reply: Option<Reply>) -> Result<Document> {
    let document = reply
        .and_then(Reply::into_first)
        .ok_or(DatabaseError::EmptyReply)?;

    if !is_ok(&document) {
        return Err(DatabaseError::Command {
            code: get_int(&document, "code").map(|c| c as i32),
            message: document
                .get_str("errmsg")
                .unwrap_or("unknown error")
                .to_string(),
        }
        .into());
    }
    Ok(document)
}
