use std::{
    collections::{HashMap, VecDeque},
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bson::{Bson, Document, doc, oid::ObjectId};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use super::{
    Operation, ProtocolTransport, Reply, TransportError,
    request::flags as op_flags,
    response::{flags as reply_flags, get_int},
};

const DEFAULT_BATCH_SIZE: usize = 101;
const DUPLICATE_KEY: i32 = 11000;
const COMMAND_NOT_FOUND: i32 = 59;
const BAD_VALUE: i32 = 2;

/// An in-memory document server speaking the wire protocol.
///
/// Enough of the server side is implemented to exercise a driver end to end:
/// unique `_id`s, per-connection `getlasterror`, equality queries with
/// projection and batching, and a handful of commands. Query operators are
/// not interpreted: a query naming one is answered with a query failure.
pub struct MemoryServer {
    address: SocketAddr,
    listener: TcpListener,
    store: Arc<Mutex<Store>>,
}

#[derive(Default)]
struct Store {
    collections: HashMap<String, Vec<Document>>,
    cursors: HashMap<i64, ServerCursor>,
    next_cursor: i64,
}

struct ServerCursor {
    position: i32,
    remaining: VecDeque<Document>,
}

impl Store {
    fn open_cursor(&mut self, remaining: VecDeque<Document>, position: i32) -> i64 {
        self.next_cursor += 1;
        self.cursors.insert(
            self.next_cursor,
            ServerCursor {
                position,
                remaining,
            },
        );
        self.next_cursor
    }
}

impl MemoryServer {
    pub async fn bind(address: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            address: listener.local_addr()?,
            listener,
            store: Arc::new(Mutex::new(Store::default())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub async fn listen(self) -> Result<(), TransportError> {
        info!("listening at {}", self.address);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    let store = Arc::clone(&self.store);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, store).await {
                            warn!("connection from {peer} failed: {e}");
                        }
                    });
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, store: Arc<Mutex<Store>>) -> Result<(), TransportError> {
    let mut transport = ProtocolTransport::new(stream);
    let mut session = Session::new(store);

    loop {
        let Some(frame) = transport.read_frame().await? else {
            return Ok(());
        };

        let (header, op) = match Operation::decode(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("dropping undecodable request: {e}");
                continue;
            }
        };
        debug!("received request {}: {op:?}", header.request_id);

        if let Some(reply) = session.execute(op) {
            session.next_request_id += 1;
            match reply.encode(session.next_request_id, header.request_id) {
                Ok(bytes) => transport.write_frame(&bytes).await?,
                Err(e) => warn!("failed to encode reply to {}: {e}", header.request_id),
            }
        }
    }
}

#[derive(Debug, Default)]
struct LastError {
    err: Option<(i32, String)>,
    n: i64,
    updated_existing: Option<bool>,
    upserted: Option<Bson>,
}

impl LastError {
    fn to_document(&self) -> Document {
        let mut out = doc! { "n": self.n };
        match &self.err {
            Some((code, message)) => {
                out.insert("err", message.clone());
                out.insert("code", *code);
            }
            None => {
                out.insert("err", Bson::Null);
            }
        }
        if let Some(updated) = self.updated_existing {
            out.insert("updatedExisting", updated);
        }
        if let Some(id) = &self.upserted {
            out.insert("upserted", id.clone());
        }
        out.insert("ok", 1.0);
        out
    }
}

/// Per-connection state: `getlasterror` answers for the connection it is sent on.
struct Session {
    store: Arc<Mutex<Store>>,
    last_error: LastError,
    next_request_id: i32,
}

impl Session {
    fn new(store: Arc<Mutex<Store>>) -> Self {
        Self {
            store,
            last_error: LastError::default(),
            next_request_id: 0,
        }
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn execute(&mut self, op: Operation) -> Option<Reply> {
        match op {
            Operation::Insert {
                namespace,
                flags,
                documents,
                ..
            } => {
                self.last_error = self.insert(&namespace, flags, documents);
                None
            }
            Operation::Update {
                namespace,
                flags,
                selector,
                update,
                ..
            } => {
                self.last_error = self.update(&namespace, flags, &selector, &update);
                None
            }
            Operation::Delete {
                namespace,
                flags,
                selector,
                ..
            } => {
                self.last_error = self.delete(&namespace, flags, &selector);
                None
            }
            Operation::Command { database, command } => Some(Reply::new(vec![
                self.command(&database, &command),
            ])),
            Operation::Query {
                namespace,
                skip,
                limit,
                query,
                fields,
                ..
            } => match namespace.strip_suffix(".$cmd") {
                Some(database) => Some(Reply::new(vec![self.command(database, &query)])),
                None => Some(self.query(&namespace, skip, limit, &query, fields.as_ref())),
            },
            Operation::GetMore {
                limit, cursor_id, ..
            } => Some(self.get_more(cursor_id, limit)),
            Operation::KillCursors { cursor_ids } => {
                let mut store = self.store();
                for id in cursor_ids {
                    store.cursors.remove(&id);
                }
                None
            }
        }
    }

    fn insert(&self, namespace: &str, flags: i32, documents: Vec<Document>) -> LastError {
        let mut store = self.store();
        let docs = store.collections.entry(namespace.to_string()).or_default();
        let mut last_error = LastError::default();

        for doc in documents {
            let doc = with_id(doc);
            let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
            if docs.iter().any(|d| d.get("_id") == Some(&id)) {
                last_error.err = Some((
                    DUPLICATE_KEY,
                    format!("E11000 duplicate key error index: {namespace}.$_id_  dup key: {{ : {id} }}"),
                ));
                if flags & op_flags::CONTINUE_ON_ERROR == 0 {
                    break;
                }
                continue;
            }
            docs.push(doc);
        }
        last_error
    }

    fn delete(&self, namespace: &str, flags: i32, selector: &Document) -> LastError {
        let single = flags & op_flags::SINGLE_REMOVE != 0;
        let mut store = self.store();
        let docs = store.collections.entry(namespace.to_string()).or_default();
        let before = docs.len();

        if single {
            if let Some(index) = docs.iter().position(|d| matches(d, selector)) {
                docs.remove(index);
            }
        } else {
            docs.retain(|d| !matches(d, selector));
        }

        LastError {
            n: (before - docs.len()) as i64,
            ..Default::default()
        }
    }

    fn update(&self, namespace: &str, flags: i32, selector: &Document, update: &Document) -> LastError {
        let multi = flags & op_flags::MULTI_UPDATE != 0;
        let mut store = self.store();
        let docs = store.collections.entry(namespace.to_string()).or_default();

        let mut n = 0;
        for doc in docs.iter_mut().filter(|d| matches(d, selector)) {
            if let Err(message) = apply_update(doc, update) {
                return LastError {
                    err: Some((9, message)),
                    ..Default::default()
                };
            }
            n += 1;
            if !multi {
                break;
            }
        }

        if n == 0 && flags & op_flags::UPSERT != 0 {
            let mut doc: Document = selector
                .iter()
                .filter(|(k, _)| !k.starts_with('$') && !k.contains('.'))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if let Err(message) = apply_update(&mut doc, update) {
                return LastError {
                    err: Some((9, message)),
                    ..Default::default()
                };
            }
            let doc = with_id(doc);
            let id = doc.get("_id").cloned();
            docs.push(doc);
            return LastError {
                n: 1,
                updated_existing: Some(false),
                upserted: id,
                ..Default::default()
            };
        }

        LastError {
            n,
            updated_existing: Some(n > 0),
            ..Default::default()
        }
    }

    fn query(
        &self,
        namespace: &str,
        skip: i32,
        limit: i32,
        query: &Document,
        fields: Option<&Document>,
    ) -> Reply {
        if let Some(operator) = query.keys().find(|k| k.starts_with('$')) {
            debug!("rejecting query on {namespace} using {operator}");
            return Reply::new(vec![doc! {
                "$err": format!("unsupported query operator {operator}"),
                "code": BAD_VALUE,
            }])
            .with_flags(reply_flags::QUERY_FAILURE);
        }

        let mut store = self.store();
        let mut found: VecDeque<Document> = store
            .collections
            .get(namespace)
            .map(|docs| {
                docs.iter()
                    .filter(|d| matches(d, query))
                    .skip(skip.max(0) as usize)
                    .map(|d| project(d, fields))
                    .collect()
            })
            .unwrap_or_default();

        // 1 and negative values ask for a single batch with no cursor left open.
        let (batch, keep_cursor) = match limit {
            0 => (DEFAULT_BATCH_SIZE, true),
            1 => (1, false),
            n if n < 0 => (n.unsigned_abs() as usize, false),
            n => (n as usize, true),
        };

        let first: Vec<Document> = found.drain(..batch.min(found.len())).collect();
        let returned = first.len() as i32;
        let cursor_id = if keep_cursor && !found.is_empty() {
            store.open_cursor(found, returned)
        } else {
            0
        };
        Reply::new(first).with_cursor(cursor_id, 0)
    }

    fn get_more(&self, cursor_id: i64, limit: i32) -> Reply {
        let mut store = self.store();
        let Some(cursor) = store.cursors.get_mut(&cursor_id) else {
            return Reply::default().with_flags(reply_flags::CURSOR_NOT_FOUND);
        };

        let batch = match limit {
            n if n <= 0 => DEFAULT_BATCH_SIZE,
            n => n as usize,
        };
        let docs: Vec<Document> = cursor.remaining.drain(..batch.min(cursor.remaining.len())).collect();
        let starting_from = cursor.position;
        cursor.position += docs.len() as i32;

        let exhausted = cursor.remaining.is_empty();
        if exhausted {
            store.cursors.remove(&cursor_id);
        }
        Reply::new(docs).with_cursor(if exhausted { 0 } else { cursor_id }, starting_from)
    }

    fn command(&mut self, database: &str, command: &Document) -> Document {
        let Some((name, value)) = command.iter().next() else {
            return command_error("empty command".to_string(), COMMAND_NOT_FOUND);
        };
        let namespace = |value: &Bson| format!("{database}.{}", value.as_str().unwrap_or_default());
        let filter = command.get_document("query").cloned().unwrap_or_default();

        match name.to_lowercase().as_str() {
            "ping" => doc! { "ok": 1.0 },
            "ismaster" => doc! { "ismaster": true, "maxBsonObjectSize": 16 * 1024 * 1024, "ok": 1.0 },
            "getlasterror" => self.last_error.to_document(),
            "count" => {
                let store = self.store();
                let n = store
                    .collections
                    .get(&namespace(value))
                    .map(|docs| docs.iter().filter(|d| matches(d, &filter)).count())
                    .unwrap_or(0);
                doc! { "n": n as f64, "ok": 1.0 }
            }
            "distinct" => {
                let key = command.get_str("key").unwrap_or_default();
                let store = self.store();
                let mut values: Vec<Bson> = Vec::new();
                for doc in store.collections.get(&namespace(value)).into_iter().flatten() {
                    if !matches(doc, &filter) {
                        continue;
                    }
                    for found in lookup(doc, key) {
                        let items = match found {
                            Bson::Array(items) => items.clone(),
                            other => vec![other.clone()],
                        };
                        for item in items {
                            if !values.iter().any(|v| values_equal(v, &item)) {
                                values.push(item);
                            }
                        }
                    }
                }
                doc! { "values": values, "ok": 1.0 }
            }
            "aggregate" => {
                let Ok(pipeline) = command.get_array("pipeline") else {
                    return command_error("'pipeline' must be an array".to_string(), BAD_VALUE);
                };
                let source = self
                    .store()
                    .collections
                    .get(&namespace(value))
                    .cloned()
                    .unwrap_or_default();
                match aggregate(source, pipeline) {
                    Ok(result) => doc! { "result": result, "ok": 1.0 },
                    Err(message) => command_error(message, BAD_VALUE),
                }
            }
            "drop" => match self.store().collections.remove(&namespace(value)) {
                Some(_) => doc! { "ns": namespace(value), "ok": 1.0 },
                None => command_error("ns not found".to_string(), 26),
            },
            "driveroidtest" => {
                let oid = value.as_object_id().unwrap_or_else(ObjectId::new);
                doc! { "oid": oid, "str": oid.to_hex(), "ok": 1.0 }
            }
            _ => command_error(format!("no such cmd: {name}"), COMMAND_NOT_FOUND),
        }
    }
}

fn command_error(message: String, code: i32) -> Document {
    doc! { "ok": 0.0, "errmsg": message, "code": code }
}

/// Run the `$match`, `$project`, `$skip` and `$limit` stages of a pipeline.
fn aggregate(mut docs: Vec<Document>, pipeline: &[Bson]) -> Result<Vec<Document>, String> {
    for stage in pipeline {
        let Some((name, arg)) = stage.as_document().and_then(|s| s.iter().next()) else {
            return Err("pipeline stage must be a document".to_string());
        };
        let count = || get_int(&doc! { "n": arg.clone() }, "n").map(|n| n.max(0) as usize);
        match (name.as_str(), arg) {
            ("$match", Bson::Document(filter)) => docs.retain(|d| matches(d, filter)),
            ("$project", Bson::Document(fields)) => {
                docs = docs.iter().map(|d| project(d, Some(fields))).collect();
            }
            ("$skip", _) => {
                let n = count().ok_or("$skip takes a number")?;
                docs.drain(..n.min(docs.len()));
            }
            ("$limit", _) => docs.truncate(count().ok_or("$limit takes a number")?),
            _ => return Err(format!("unsupported pipeline stage {name}")),
        }
    }
    Ok(docs)
}

/// Put an `_id` in front of documents that lack one.
fn with_id(doc: Document) -> Document {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut out = doc! { "_id": ObjectId::new() };
    for (key, value) in doc {
        out.insert(key, value);
    }
    out
}

/// Every value reachable at a dotted path, descending through arrays.
fn lookup<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    fn walk<'a>(value: &'a Bson, path: &[&str], out: &mut Vec<&'a Bson>) {
        match path.split_first() {
            None => out.push(value),
            Some((head, rest)) => match value {
                Bson::Document(doc) => {
                    if let Some(v) = doc.get(*head) {
                        walk(v, rest, out);
                    }
                }
                Bson::Array(items) => items.iter().for_each(|item| walk(item, path, out)),
                _ => {}
            },
        }
    }

    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some(v) = doc.get(segments[0]) {
        walk(v, &segments[1..], &mut out);
    }
    out
}

fn values_equal(a: &Bson, b: &Bson) -> bool {
    let as_f64 = |v: &Bson| match v {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(d) => Some(*d),
        _ => None,
    };
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Equality matching; arrays match when any element is equal.
fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| {
        if key.starts_with('$') {
            return false;
        }
        lookup(doc, key).into_iter().any(|found| {
            values_equal(found, expected)
                || matches!(found, Bson::Array(items) if items.iter().any(|i| values_equal(i, expected)))
        })
    })
}

fn project(doc: &Document, fields: Option<&Document>) -> Document {
    let Some(fields) = fields.filter(|f| !f.is_empty()) else {
        return doc.clone();
    };

    let wanted: Vec<&str> = fields
        .iter()
        .filter(|(_, v)| !matches!(v, Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false)))
        .map(|(k, _)| k.split('.').next().unwrap_or(k.as_str()))
        .collect();
    let keep_id = !matches!(
        fields.get("_id"),
        Some(Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false))
    );

    doc.iter()
        .filter(|(k, _)| (k.as_str() == "_id" && keep_id) || wanted.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn apply_update(doc: &mut Document, update: &Document) -> Result<(), String> {
    let is_operator = update.keys().next().is_some_and(|k| k.starts_with('$'));
    if !is_operator {
        let mut replaced = Document::new();
        if let Some(id) = doc.get("_id") {
            replaced.insert("_id", id.clone());
        }
        for (key, value) in update {
            replaced.insert(key.clone(), value.clone());
        }
        *doc = replaced;
        return Ok(());
    }

    for (op, operand) in update {
        let Bson::Document(operand) = operand else {
            return Err(format!("{op} requires a document"));
        };
        for (path, value) in operand {
            match op.as_str() {
                "$set" => set_path(doc, path, value.clone()),
                "$unset" => {
                    unset_path(doc, path);
                }
                "$inc" => {
                    let current = lookup(doc, path).first().and_then(|v| match v {
                        Bson::Int32(i) => Some(i64::from(*i)),
                        Bson::Int64(i) => Some(*i),
                        _ => None,
                    });
                    let by = get_int(operand, path).ok_or(format!("cannot $inc by {value}"))?;
                    set_path(doc, path, Bson::Int64(current.unwrap_or(0) + by));
                }
                other => return Err(format!("unsupported update operator {other}")),
            }
        }
    }
    Ok(())
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                set_path(inner, rest, value);
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Bson::Document(inner)) => unset_path(inner, rest),
            _ => None,
        },
    }
}

/// Start a server on an ephemeral local port and return its address.
#[cfg(test)]
pub(crate) async fn spawn_test_server() -> SocketAddr {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = MemoryServer::bind("127.0.0.1:0").await.unwrap();
    let address = server.local_addr();
    tokio::spawn(server.listen());
    address
}

/// Like [`spawn_test_server`], also counting accepted sockets.
#[cfg(test)]
pub(crate) async fn spawn_counting_test_server() -> (SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(Mutex::new(Store::default()));

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(handle_connection(stream, Arc::clone(&store)));
        }
    });
    (address, accepted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(Arc::new(Mutex::new(Store::default())))
    }

    fn last_error(session: &mut Session) -> Document {
        session.command("test", &doc! { "getlasterror": 1 })
    }

    #[test]
    fn duplicate_id_sets_last_error() {
        let mut session = session();
        let insert = Operation::insert("test.c", vec![doc! { "_id": 1 }]);

        assert!(session.execute(insert.clone()).is_none());
        assert_eq!(last_error(&mut session).get("err"), Some(&Bson::Null));

        session.execute(insert);
        let status = last_error(&mut session);
        assert_eq!(status.get_i32("code").unwrap(), DUPLICATE_KEY);
        assert!(status.get_str("err").unwrap().starts_with("E11000"));
    }

    #[test]
    fn continue_on_error_inserts_the_rest() {
        let mut session = session();
        session.execute(Operation::insert("test.c", vec![doc! { "_id": 1 }]));
        session.execute(
            Operation::insert("test.c", vec![doc! { "_id": 1 }, doc! { "_id": 2 }])
                .with_flags(op_flags::CONTINUE_ON_ERROR),
        );

        assert_eq!(session.store().collections["test.c"].len(), 2);
    }

    #[test]
    fn update_operators_and_upsert() {
        let mut session = session();
        session.execute(Operation::insert("test.c", vec![doc! { "_id": 1, "n": 1 }]));

        session.execute(Operation::update(
            "test.c",
            doc! { "_id": 1 },
            doc! { "$set": { "name": "x", "a.b": true }, "$inc": { "n": 2 } },
        ));
        let doc = session.store().collections["test.c"][0].clone();
        assert_eq!(doc.get_str("name").unwrap(), "x");
        assert_eq!(doc.get_document("a").unwrap().get_bool("b").unwrap(), true);
        assert_eq!(doc.get_i64("n").unwrap(), 3);

        session.execute(
            Operation::update("test.c", doc! { "_id": 2 }, doc! { "$set": { "y": 1 } })
                .with_flags(op_flags::UPSERT),
        );
        let status = last_error(&mut session);
        assert_eq!(status.get_bool("updatedExisting").unwrap(), false);
        assert_eq!(status.get("upserted"), Some(&Bson::Int32(2)));
    }

    #[test]
    fn query_batches_and_get_more() {
        let mut session = session();
        let docs = (0..5).map(|i| doc! { "_id": i, "k": 1 }).collect();
        session.execute(Operation::insert("test.c", docs));

        let first = session
            .execute(Operation::query("test.c", doc! { "k": 1 }).with_limit(2))
            .unwrap();
        assert_eq!(first.documents.len(), 2);
        assert_ne!(first.cursor_id, 0);

        let rest = session.get_more(first.cursor_id, 10);
        assert_eq!(rest.documents.len(), 3);
        assert_eq!(rest.starting_from, 2);
        assert_eq!(rest.cursor_id, 0);

        assert!(session.get_more(first.cursor_id, 10).cursor_not_found());
    }

    #[test]
    fn query_operators_are_query_failures() {
        let session = session();
        let reply = session.query("test.c", 0, 0, &doc! { "$where": "1" }, None);

        assert!(reply.query_failure());
        assert!(reply.first().unwrap().get_str("$err").unwrap().contains("$where"));
    }

    #[test]
    fn matches_through_arrays_and_projects() {
        let doc = doc! { "_id": 1, "name": "n", "comment": [{ "author": "joe" }, { "author": "ana" }] };

        assert!(matches(&doc, &doc! { "comment.author": "joe" }));
        assert!(!matches(&doc, &doc! { "comment.author": "bob" }));
        assert!(!matches(&doc, &doc! { "$where": "1" }));

        let projected = project(&doc, Some(&doc! { "comment.$.author": 1 }));
        assert_eq!(projected.keys().collect::<Vec<_>>(), vec!["_id", "comment"]);
    }

    #[test]
    fn count_distinct_and_unknown_commands() {
        let mut session = session();
        session.execute(Operation::insert(
            "test.c",
            vec![
                doc! { "_id": 1, "p": "a", "u": 100 },
                doc! { "_id": 2, "p": "a", "u": 100 },
                doc! { "_id": 3, "p": "b", "u": 200 },
            ],
        ));

        let count = session.command("test", &doc! { "count": "c", "query": { "p": "a" } });
        assert_eq!(get_int(&count, "n"), Some(2));

        let distinct = session.command("test", &doc! { "distinct": "c", "key": "u" });
        assert_eq!(distinct.get_array("values").unwrap(), &vec![Bson::Int32(100), Bson::Int32(200)]);

        let aggregated = session.command(
            "test",
            &doc! { "aggregate": "c", "pipeline": [{ "$match": { "p": "a" } }, { "$skip": 1 }, { "$project": { "u": 1 } }] },
        );
        assert_eq!(aggregated.get_array("result").unwrap(), &vec![Bson::Document(doc! { "_id": 2, "u": 100 })]);

        let unknown = session.command("test", &doc! { "frobnicate": 1 });
        assert_eq!(unknown.get_str("errmsg").unwrap(), "no such cmd: frobnicate");
    }
}
