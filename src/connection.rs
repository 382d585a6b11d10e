//! Multiplexed request/response exchange with a single server.
//!
//! A [`Connection`] owns exactly one socket. Many logical requests may be in flight on it at
//! once: each is written under an async mutex, so frames reach the socket whole and in issue
//! order, and a dedicated reader task matches every inbound OP_REPLY to the request whose id it
//! echoes in `responseTo`. Replies may therefore complete callers in any order.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──> Connected ──> Closed
//!                    ^            │ (autoreconnect, next dispatch)
//!                    └─ Reconnecting
//! ```
//!
//! - [`Connection::connect`] returns only once the socket is open; an unreachable endpoint is an
//!   [`InterfaceError::Connect`].
//! - When the peer hangs up or [`Connection::close`] is called, every unanswered request is
//!   failed. With `autoreconnect` the next dispatch reopens the socket first; without it the
//!   dispatch fails with [`InterfaceError::Closed`].
//! - Writes are never retried. Only establishing the socket is.
//!
//! # Acknowledged writes
//!
//! A write carrying [`WriteConcern::Acknowledged`] is followed, under the same lock hold, by a
//! `getlasterror` command. The caller completes with that command's reply, or with
//! [`Error::Integrity`] when it reports an error.
//!
//! # Cancellation
//!
//! Sent requests cannot be cancelled. Dropping a [`PendingReply`] only discards the answer;
//! closing the connection is the one way to abandon outstanding work, and it resolves all of it.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicI32, Ordering},
    },
    time::Duration,
};

use bson::Bson;
use log::{debug, info, trace, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{Mutex as AsyncMutex, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};

use crate::{
    config::{ClientOptions, HostAddr},
    error::{DatabaseError, Error, InterfaceError, Result},
    protocol::{MsgHeader, Operation, ProtocolTransport, Reply, WriteConcern, get_int, is_ok},
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Completion = oneshot::Sender<Result<Reply>>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Bookkeeping for one unanswered request id.
struct PendingRequest {
    completion: Completion,
    /// The reply is a `getlasterror` status and must be inspected before completing.
    status_check: bool,
}

/// The socket-facing half guarded by the write lock.
struct Link {
    writer: Option<ProtocolTransport<BoxedWriter>>,
    reader: Option<JoinHandle<()>>,
    /// Bumped on every (re)open so a reader from an old socket cannot tear down a new one.
    generation: u64,
}

struct Shared {
    address: HostAddr,
    autoreconnect: bool,
    connect_timeout: Duration,
    next_request_id: AtomicI32,
    pending: Mutex<HashMap<i32, PendingRequest>>,
    link: AsyncMutex<Link>,
    state: watch::Sender<ConnectionState>,
}

/// A handle to one server socket. Clones share the socket.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .field("autoreconnect", &self.shared.autoreconnect)
            .finish()
    }
}

/// The eventual answer to a dispatched operation.
#[derive(Debug)]
pub struct PendingReply {
    request_id: i32,
    inner: PendingInner,
}

#[derive(Debug)]
enum PendingInner {
    Ready,
    Waiting(oneshot::Receiver<Result<Reply>>),
}

impl PendingReply {
    /// Id of the frame whose reply completes this request, if one is expected.
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    /// `Ok(None)` for writes that expect no answer.
    pub async fn wait(self) -> Result<Option<Reply>> {
        match self.inner {
            PendingInner::Ready => Ok(None),
            PendingInner::Waiting(rx) => match rx.await {
                Ok(result) => result.map(Some),
                // The entry was dropped without being completed.
                Err(_) => Err(InterfaceError::Closed.into()),
            },
        }
    }
}

impl Connection {
    /// Open a connection, failing if the server cannot be reached.
    ///
    /// Dialing is bounded by `options.connect_timeout`.
    pub async fn connect(address: HostAddr, options: &ClientOptions) -> Result<Self> {
        let shared = Arc::new(Shared::new(
            address,
            options.autoreconnect,
            options.connect_timeout,
        ));
        let connection = Connection { shared };

        let stream = connection.shared.open().await.inspect_err(|_| {
            connection.shared.state.send_replace(ConnectionState::Closed);
        })?;
        let (reader, writer) = stream.into_split();
        {
            let mut link = connection.shared.link.lock().await;
            connection.install(&mut link, Box::new(reader), Box::new(writer));
        }
        info!("connected to {}", connection.shared.address);
        Ok(connection)
    }

    /// Wrap an already-open stream. The connection cannot reopen it, so
    /// `autoreconnect` only has effect for TCP addresses that can be dialed.
    pub async fn from_stream<S>(address: HostAddr, stream: S, autoreconnect: bool) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_halves(address, Box::new(reader), Box::new(writer), autoreconnect).await
    }

    pub(crate) async fn from_halves(
        address: HostAddr,
        reader: BoxedReader,
        writer: BoxedWriter,
        autoreconnect: bool,
    ) -> Self {
        let shared = Arc::new(Shared::new(address, autoreconnect, DEFAULT_CONNECT_TIMEOUT));
        let connection = Connection { shared };
        {
            let mut link = connection.shared.link.lock().await;
            connection.install(&mut link, reader, writer);
        }
        connection
    }

    pub fn address(&self) -> &HostAddr {
        &self.shared.address
    }

    pub fn autoreconnect(&self) -> bool {
        self.shared.autoreconnect
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Closed for good: a dispatch would fail rather than reconnect.
    pub fn is_hard_failed(&self) -> bool {
        self.is_closed() && !self.shared.autoreconnect
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Number of requests written but not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending().len()
    }

    /// Send `operation` and wait for its outcome.
    pub async fn send(&self, operation: Operation) -> Result<Option<Reply>> {
        self.dispatch(operation).await?.wait().await
    }

    /// Write `operation` to the socket and return a handle to its reply.
    ///
    /// Returns once the frame (and, for acknowledged writes, the status check
    /// that follows it) has been written.
    pub async fn dispatch(&self, operation: Operation) -> Result<PendingReply> {
        let mut link = self.shared.link.lock().await;

        if link.writer.is_none() {
            if !self.shared.autoreconnect {
                return Err(InterfaceError::Closed.into());
            }
            self.reopen(&mut link).await?;
        }

        let request_id = self.shared.next_request_id();
        let frame = operation
            .encode(request_id)
            .map_err(DatabaseError::Encode)?;

        if operation.expects_reply() {
            let rx = self.shared.register(request_id, false);
            self.write(&mut link, &[request_id], &[&frame]).await?;
            trace!("dispatched request {request_id} to {}", self.shared.address);
            return Ok(PendingReply {
                request_id,
                inner: PendingInner::Waiting(rx),
            });
        }

        match operation.concern() {
            WriteConcern::Unacknowledged => {
                self.write(&mut link, &[], &[&frame]).await?;
                Ok(PendingReply {
                    request_id,
                    inner: PendingInner::Ready,
                })
            }
            WriteConcern::Acknowledged => {
                let database = operation.database().unwrap_or_default();
                let check_id = self.shared.next_request_id();
                let check = Operation::last_error(database)
                    .encode(check_id)
                    .map_err(DatabaseError::Encode)?;

                let rx = self.shared.register(check_id, true);
                self.write(&mut link, &[check_id], &[&frame, &check]).await?;
                trace!("dispatched acknowledged write {request_id} (status check {check_id})");
                Ok(PendingReply {
                    request_id: check_id,
                    inner: PendingInner::Waiting(rx),
                })
            }
        }
    }

    /// Close the socket and fail every unanswered request. Closing twice is a no-op.
    pub async fn close(&self) {
        let mut link = self.shared.link.lock().await;
        if link.writer.is_none() && self.is_closed() {
            return;
        }

        self.shared
            .teardown(&mut link, || InterfaceError::Closed.into())
            .await;
        info!("closed connection to {}", self.shared.address);
    }

    /// Write frames in order; on failure tear the socket down and hand back the raw error.
    async fn write(&self, link: &mut Link, registered: &[i32], frames: &[&[u8]]) -> Result<()> {
        let Some(writer) = link.writer.as_mut() else {
            self.shared.forget(registered);
            return Err(InterfaceError::Closed.into());
        };

        for frame in frames {
            if let Err(e) = writer.write_frame(frame).await {
                warn!("write to {} failed: {e}", self.shared.address);
                self.shared.forget(registered);
                let reason = e.to_string();
                self.shared
                    .teardown(link, || InterfaceError::ConnectionLost(reason.clone()).into())
                    .await;
                return Err(Error::Io(e));
            }
        }
        Ok(())
    }

    async fn reopen(&self, link: &mut Link) -> Result<()> {
        debug!("reconnecting to {}", self.shared.address);
        self.shared.state.send_replace(ConnectionState::Reconnecting);

        match self.shared.open().await {
            Ok(stream) => {
                let (reader, writer) = stream.into_split();
                self.install(link, Box::new(reader), Box::new(writer));
                info!("reconnected to {}", self.shared.address);
                Ok(())
            }
            Err(e) => {
                self.shared.state.send_replace(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    fn install(&self, link: &mut Link, reader: BoxedReader, writer: BoxedWriter) {
        link.generation += 1;
        link.writer = Some(ProtocolTransport::new(writer));
        link.reader = Some(tokio::spawn(read_loop(
            Arc::downgrade(&self.shared),
            ProtocolTransport::new(reader),
            link.generation,
        )));
        self.shared.state.send_replace(ConnectionState::Connected);
    }
}

impl Shared {
    fn new(address: HostAddr, autoreconnect: bool, connect_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            address,
            autoreconnect,
            connect_timeout,
            next_request_id: AtomicI32::new(1),
            pending: Mutex::new(HashMap::new()),
            link: AsyncMutex::new(Link {
                writer: None,
                reader: None,
                generation: 0,
            }),
            state,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<i32, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open(&self) -> Result<TcpStream> {
        let address = self.address.to_string();
        let connect_error = |source| InterfaceError::Connect {
            address: address.clone(),
            source,
        };

        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((self.address.host.as_str(), self.address.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(connect_error(e).into()),
            Err(_) => {
                return Err(connect_error(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connection timed out",
                ))
                .into());
            }
        };
        stream.set_nodelay(true).map_err(connect_error)?;
        Ok(stream)
    }

    /// Next request id, skipping zero and any id still awaiting a reply.
    fn next_request_id(&self) -> i32 {
        let pending = self.pending();
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn register(&self, request_id: i32, status_check: bool) -> oneshot::Receiver<Result<Reply>> {
        let (completion, rx) = oneshot::channel();
        self.pending().insert(
            request_id,
            PendingRequest {
                completion,
                status_check,
            },
        );
        rx
    }

    fn forget(&self, request_ids: &[i32]) {
        let mut pending = self.pending();
        for id in request_ids {
            pending.remove(id);
        }
    }

    /// Route one inbound frame to its waiting caller.
    ///
    /// Returns an error only when the frame header itself is unreadable, in
    /// which case the stream can no longer be trusted.
    fn deliver(&self, frame: &[u8]) -> Result<(), crate::protocol::CodecError> {
        let header = MsgHeader::parse(frame)?;
        let Some(entry) = self.pending().remove(&header.response_to) else {
            warn!(
                "dropping reply {} to unknown request {} from {}",
                header.request_id, header.response_to, self.address
            );
            return Ok(());
        };

        let result = Reply::decode(frame)
            .map_err(|e| Error::from(DatabaseError::Decode(e)))
            .and_then(|reply| match entry.status_check {
                true => check_last_error(reply),
                false => Ok(reply),
            });
        trace!("completing request {}", header.response_to);
        // The caller may have stopped waiting.
        let _ = entry.completion.send(result);
        Ok(())
    }

    fn fail_pending(&self, reason: impl Fn() -> Error) {
        let drained: Vec<PendingRequest> = self.pending().drain().map(|(_, entry)| entry).collect();
        if !drained.is_empty() {
            debug!("failing {} pending requests to {}", drained.len(), self.address);
        }
        for entry in drained {
            let _ = entry.completion.send(Err(reason()));
        }
    }

    async fn teardown(&self, link: &mut Link, reason: impl Fn() -> Error) {
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        if let Some(mut writer) = link.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.state.send_replace(ConnectionState::Closed);
        self.fail_pending(reason);
    }

    /// Called by a reader task whose socket hit EOF or an unreadable frame.
    async fn lost(&self, generation: u64, reason: String) {
        let mut link = self.link.lock().await;
        if link.generation != generation || link.writer.is_none() {
            return;
        }
        warn!("connection to {} lost: {reason}", self.address);

        // This task is the reader; drop its handle instead of aborting itself.
        link.reader = None;
        if let Some(mut writer) = link.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.state.send_replace(ConnectionState::Closed);
        self.fail_pending(|| InterfaceError::ConnectionLost(reason.clone()).into());
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // The last handle is gone: stop the reader so the socket is released.
        if let Some(reader) = self.link.get_mut().reader.take() {
            reader.abort();
        }
    }
}

/// Reads replies until the socket fails or every [`Connection`] handle is dropped.
async fn read_loop(shared: Weak<Shared>, mut transport: ProtocolTransport<BoxedReader>, generation: u64) {
    let reason = loop {
        let frame = transport.read_frame().await;
        let Some(live) = shared.upgrade() else {
            return;
        };
        match frame {
            Ok(Some(frame)) => {
                if let Err(e) = live.deliver(&frame) {
                    break format!("unreadable frame: {e}");
                }
            }
            Ok(None) => break "closed by peer".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    if let Some(live) = shared.upgrade() {
        live.lost(generation, reason).await;
    }
}

/// Turn a `getlasterror` reply into the outcome of the write it follows.
fn check_last_error(reply: Reply) -> Result<Reply> {
    let Some(status) = reply.first() else {
        return Err(DatabaseError::EmptyReply.into());
    };

    match status.get("err") {
        Some(Bson::String(message)) => {
            return Err(Error::Integrity {
                code: get_int(status, "code").map(|c| c as i32),
                message: message.clone(),
            });
        }
        Some(Bson::Null) | None => {}
        Some(other) => {
            return Err(Error::Integrity {
                code: get_int(status, "code").map(|c| c as i32),
                message: other.to_string(),
            });
        }
    }

    if !is_ok(status) {
        return Err(DatabaseError::Command {
            code: get_int(status, "code").map(|c| c as i32),
            message: status.get_str("errmsg").unwrap_or("unknown error").to_string(),
        }
        .into());
    }
    Ok(reply)
}
