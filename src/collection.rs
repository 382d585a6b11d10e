use bson::{Bson, Document, doc, oid::ObjectId};
use log::debug;

use crate::{
    connection::Connection,
    database::Database,
    error::{DatabaseError, Result},
    protocol::{Operation, Reply, WriteConcern, get_int, op_flags},
};

/// Per-call write settings. Unset fields fall back to the client options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub safe: Option<bool>,
    pub check_keys: Option<bool>,
}

impl WriteOptions {
    pub fn safe(safe: bool) -> Self {
        Self {
            safe: Some(safe),
            ..Default::default()
        }
    }

    pub fn with_check_keys(mut self, check_keys: bool) -> Self {
        self.check_keys = Some(check_keys);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub upsert: bool,
    pub multi: bool,
    pub write: WriteOptions,
}

impl UpdateOptions {
    fn flags(&self) -> i32 {
        let mut flags = 0;
        if self.upsert {
            flags |= op_flags::UPSERT;
        }
        if self.multi {
            flags |= op_flags::MULTI_UPDATE;
        }
        flags
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub fields: Option<Document>,
    pub skip: i32,
    /// Maximum number of documents to return; zero for no limit. A negative
    /// value returns at most that many documents in a single batch and
    /// leaves no cursor open.
    pub limit: i32,
    /// Documents per round trip; zero lets the server choose.
    pub batch_size: i32,
}

/// Document-level operations on one collection of a [`Database`].
#[derive(Clone)]
pub struct Collection {
    database: Database,
    name: String,
}

impl Collection {
    pub(crate) fn new(database: Database, name: &str) -> Self {
        Self {
            database,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<database>.<collection>`.
    pub fn namespace(&self) -> Result<String> {
        Ok(format!("{}.{}", self.database.name()?, self.name))
    }

    /// Insert one document, returning its `_id`. An `_id` is generated when missing.
    pub async fn insert_one(&self, document: Document, options: WriteOptions) -> Result<Bson> {
        let mut ids = self.insert_many(vec![document], options).await?;
        ids.pop().ok_or_else(|| DatabaseError::EmptyReply.into())
    }

    pub async fn insert_many(&self, documents: Vec<Document>, options: WriteOptions) -> Result<Vec<Bson>> {
        let documents: Vec<Document> = documents.into_iter().map(ensure_id).collect();
        let ids = documents
            .iter()
            .filter_map(|d| d.get("_id").cloned())
            .collect();

        let op = Operation::insert(self.namespace()?, documents);
        self.write(op, options).await?;
        Ok(ids)
    }

    /// Returns the write status, or `None` for unacknowledged writes.
    pub async fn update(
        &self,
        selector: Document,
        update: Document,
        options: UpdateOptions,
    ) -> Result<Option<Document>> {
        let op = Operation::update(self.namespace()?, selector, update).with_flags(options.flags());
        self.write(op, options.write).await
    }

    pub async fn remove(&self, selector: Document, options: WriteOptions) -> Result<Option<Document>> {
        let op = Operation::delete(self.namespace()?, selector);
        self.write(op, options).await
    }

    pub async fn remove_by_id(&self, id: impl Into<Bson>, options: WriteOptions) -> Result<Option<Document>> {
        let op = Operation::delete(self.namespace()?, doc! { "_id": id.into() })
            .with_flags(op_flags::SINGLE_REMOVE);
        self.write(op, options).await
    }

    /// Run a query and drain its cursor.
    ///
    /// Every batch is fetched over the connection that opened the cursor. A
    /// cursor still open when the limit is reached is killed.
    pub async fn find(&self, filter: Document, options: FindOptions) -> Result<Vec<Document>> {
        let namespace = self.namespace()?;
        let connection = self.database.pool()?.acquire().await?;

        let single_batch = options.limit < 0;
        let limit = options.limit.saturating_abs();
        let batch_size = options.batch_size.max(0);
        // A negative count asks for a single batch and no cursor.
        let first_batch = match (limit, batch_size) {
            (l, _) if single_batch => -l,
            (0, n) => n,
            (l, 0) => -l,
            (l, n) if l <= n => -l,
            (_, n) => n,
        };

        let mut op = Operation::query(namespace.clone(), filter)
            .with_skip(options.skip)
            .with_limit(first_batch);
        if let Some(fields) = options.fields {
            op = op.with_fields(fields);
        }

        let mut reply = query_reply(&connection, op).await?;
        let mut documents = Vec::new();
        loop {
            let cursor_id = reply.cursor_id;
            documents.append(&mut reply.documents);

            if single_batch || (limit > 0 && documents.len() >= limit as usize) {
                documents.truncate(limit as usize);
                if cursor_id != 0 {
                    debug!("killing cursor {cursor_id} on {namespace}");
                    connection.send(Operation::kill_cursors(vec![cursor_id])).await?;
                }
                break;
            }
            if cursor_id == 0 {
                break;
            }

            let wanted = match limit {
                0 => batch_size,
                l => {
                    let remaining = l - documents.len() as i32;
                    if batch_size == 0 { remaining } else { remaining.min(batch_size) }
                }
            };
            let get_more = Operation::get_more(namespace.clone(), cursor_id, wanted);
            reply = query_reply(&connection, get_more).await?;
            if reply.cursor_not_found() {
                return Err(DatabaseError::CursorNotFound(cursor_id).into());
            }
        }
        Ok(documents)
    }

    pub async fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        let options = FindOptions {
            limit: 1,
            ..Default::default()
        };
        Ok(self.find(filter, options).await?.into_iter().next())
    }

    pub async fn find_by_id(&self, id: impl Into<Bson>) -> Result<Option<Document>> {
        self.find_one(doc! { "_id": id.into() }).await
    }

    pub async fn count(&self, filter: Document) -> Result<u64> {
        let reply = self
            .database
            .command(doc! { "count": self.name.as_str(), "query": filter })
            .await?;
        let n = get_int(&reply, "n")
            .ok_or_else(|| DatabaseError::UnexpectedReply("count reply has no numeric 'n'".to_string()))?;
        Ok(n.max(0) as u64)
    }

    pub async fn distinct(&self, key: &str, filter: Document) -> Result<Vec<Bson>> {
        let mut reply = self
            .database
            .command(doc! { "distinct": self.name.as_str(), "key": key, "query": filter })
            .await?;
        match reply.remove("values") {
            Some(Bson::Array(values)) => Ok(values),
            _ => Err(DatabaseError::UnexpectedReply("distinct reply has no 'values' array".to_string()).into()),
        }
    }

    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let mut reply = self
            .database
            .command(doc! { "aggregate": self.name.as_str(), "pipeline": pipeline })
            .await?;
        documents(reply.remove("result"), "aggregate", "result")
    }

    /// Group matching documents by `key` and fold each group with the
    /// JavaScript `reduce` function, starting from `initial`.
    ///
    /// A `key` of `None` folds every matching document into a single group.
    pub async fn group(
        &self,
        key: Option<Document>,
        condition: Document,
        initial: Document,
        reduce: &str,
    ) -> Result<Vec<Document>> {
        let mut spec = doc! { "ns": self.name.as_str() };
        if let Some(key) = key {
            spec.insert("key", key);
        }
        spec.insert("cond", condition);
        spec.insert("initial", initial);
        spec.insert("$reduce", Bson::JavaScriptCode(reduce.to_string()));

        let mut reply = self.database.command(doc! { "group": spec }).await?;
        documents(reply.remove("retval"), "group", "retval")
    }

    pub async fn drop(&self) -> Result<()> {
        self.database.command(doc! { "drop": self.name.as_str() }).await?;
        Ok(())
    }

    async fn write(&self, op: Operation, options: WriteOptions) -> Result<Option<Document>> {
        let pool = self.database.pool()?;
        let defaults = pool.options();
        let concern = options
            .safe
            .map(WriteConcern::from_safe)
            .unwrap_or(defaults.write_concern);
        let op = op
            .with_concern(concern)
            .with_check_keys(options.check_keys.unwrap_or(defaults.check_keys));

        let reply = pool.send(op).await?;
        Ok(reply.and_then(Reply::into_first))
    }
}

/// The documents of an array field in a command reply.
fn documents(field: Option<Bson>, command: &str, name: &str) -> Result<Vec<Document>> {
    let Some(Bson::Array(items)) = field else {
        return Err(DatabaseError::UnexpectedReply(format!("{command} reply has no '{name}' array")).into());
    };
    items
        .into_iter()
        .map(|item| match item {
            Bson::Document(doc) => Ok(doc),
            other => Err(DatabaseError::UnexpectedReply(format!(
                "{command} reply holds a non-document {other}"
            ))
            .into()),
        })
        .collect()
}

/// Send a query or get-more and turn a query failure into an error.
async fn query_reply(connection: &Connection, op: Operation) -> Result<Reply> {
    let reply = connection.send(op).await?.ok_or(DatabaseError::EmptyReply)?;
    if reply.query_failure() {
        let message = reply
            .first()
            .and_then(|d| d.get_str("$err").ok())
            .unwrap_or("query failure")
            .to_string();
        return Err(DatabaseError::QueryFailure(message).into());
    }
    Ok(reply)
}

fn ensure_id(document: Document) -> Document {
    if document.contains_key("_id") {
        return document;
    }
    let mut out = doc! { "_id": ObjectId::new() };
    for (key, value) in document {
        out.insert(key, value);
    }
    out
}
