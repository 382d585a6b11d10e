use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::{
    config::{ClientOptions, HostAddr},
    connection::Connection,
    error::{InterfaceError, Result},
    protocol::{Operation, Reply},
};

/// One configured endpoint and its connection slots.
struct Member {
    address: HostAddr,
    slots: Vec<Mutex<Option<Connection>>>,
    next_slot: AtomicUsize,
}

impl Member {
    fn new(address: HostAddr, slots: usize) -> Self {
        Self {
            address,
            slots: (0..slots).map(|_| Mutex::new(None)).collect(),
            next_slot: AtomicUsize::new(0),
        }
    }
}

/// Routes operations across a static list of servers.
///
/// Each call to [`ConnectionPool::acquire`] advances a shared rotation, first
/// over hosts and then over the slots of the chosen host. Slots are dialed on
/// first use. A member that cannot serve the acquire fails it with an
/// [`InterfaceError`]; the pool does not try another member, the next acquire
/// simply lands elsewhere.
pub struct ConnectionPool {
    members: Vec<Member>,
    cursor: AtomicUsize,
    options: ClientOptions,
}

impl ConnectionPool {
    pub fn new(options: ClientOptions) -> Result<Self> {
        options.validate()?;
        let members = options
            .hosts
            .iter()
            .map(|host| Member::new(host.clone(), options.connections_per_host))
            .collect();

        Ok(Self {
            members,
            cursor: AtomicUsize::new(0),
            options,
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn hosts(&self) -> Vec<HostAddr> {
        self.members.iter().map(|m| m.address.clone()).collect()
    }

    /// Connections currently held by the pool, open or waiting to reconnect.
    pub async fn open_connections(&self) -> usize {
        let mut count = 0;
        for member in &self.members {
            for slot in &member.slots {
                if slot.lock().await.is_some() {
                    count += 1;
                }
            }
        }
        count
    }

    /// Pick the next connection in rotation, dialing it if needed.
    pub async fn acquire(&self) -> Result<Connection> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.members.len();
        let member = &self.members[index];
        let slot_index = member.next_slot.fetch_add(1, Ordering::Relaxed) % member.slots.len();
        let mut slot = member.slots[slot_index].lock().await;

        if let Some(connection) = slot.as_ref() {
            if !connection.is_hard_failed() {
                return Ok(connection.clone());
            }
            warn!(
                "evicting failed connection to {} (slot {slot_index})",
                member.address
            );
            *slot = None;
            return Err(InterfaceError::Closed.into());
        }

        debug!("dialing {} for slot {slot_index}", member.address);
        let connection = Connection::connect(member.address.clone(), &self.options).await?;
        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// Send `operation` over the next connection in rotation.
    pub async fn send(&self, operation: Operation) -> Result<Option<Reply>> {
        self.acquire().await?.send(operation).await
    }

    /// Close and drop every pooled connection. Calling it again is harmless.
    pub async fn close(&self) {
        for member in &self.members {
            for slot in &member.slots {
                if let Some(connection) = slot.lock().await.take() {
                    connection.close().await;
                }
            }
        }
        info!("connection pool closed");
    }
}
