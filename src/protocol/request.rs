use bson::{Document, doc};

use super::wire::{BodyReader, CodecError, FrameBuilder, MsgHeader, OpCode, check_keys};

/// Whether a write is followed by a status check before it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteConcern {
    /// Fire-and-forget: completes once the bytes are on the socket.
    Unacknowledged,
    /// Chains `getlasterror` and completes with its reply.
    #[default]
    Acknowledged,
}

impl WriteConcern {
    pub fn from_safe(safe: bool) -> Self {
        if safe {
            WriteConcern::Acknowledged
        } else {
            WriteConcern::Unacknowledged
        }
    }

    pub fn is_acknowledged(self) -> bool {
        self == WriteConcern::Acknowledged
    }
}

pub mod flags {
    pub const UPSERT: i32 = 1;
    pub const MULTI_UPDATE: i32 = 1 << 1;

    pub const CONTINUE_ON_ERROR: i32 = 1;

    pub const SINGLE_REMOVE: i32 = 1;

    pub const TAILABLE_CURSOR: i32 = 1 << 1;
    pub const SLAVE_OK: i32 = 1 << 2;
    pub const NO_CURSOR_TIMEOUT: i32 = 1 << 4;
    pub const AWAIT_DATA: i32 = 1 << 5;
    pub const EXHAUST: i32 = 1 << 6;
    pub const PARTIAL: i32 = 1 << 7;
}

/// A protocol operation, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Query {
        namespace: String,
        flags: i32,
        skip: i32,
        limit: i32,
        query: Document,
        fields: Option<Document>,
    },
    Insert {
        namespace: String,
        flags: i32,
        documents: Vec<Document>,
        concern: WriteConcern,
        check_keys: bool,
    },
    Update {
        namespace: String,
        flags: i32,
        selector: Document,
        update: Document,
        concern: WriteConcern,
        check_keys: bool,
    },
    Delete {
        namespace: String,
        flags: i32,
        selector: Document,
        concern: WriteConcern,
    },
    GetMore {
        namespace: String,
        limit: i32,
        cursor_id: i64,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
    /// Sent as an OP_QUERY on `<database>.$cmd` asking for a single document.
    Command { database: String, command: Document },
}

impl Operation {
    pub fn query(namespace: impl Into<String>, query: Document) -> Self {
        Operation::Query {
            namespace: namespace.into(),
            flags: 0,
            skip: 0,
            limit: 0,
            query,
            fields: None,
        }
    }

    pub fn insert(namespace: impl Into<String>, documents: Vec<Document>) -> Self {
        Operation::Insert {
            namespace: namespace.into(),
            flags: 0,
            documents,
            concern: WriteConcern::Acknowledged,
            check_keys: true,
        }
    }

    pub fn update(namespace: impl Into<String>, selector: Document, update: Document) -> Self {
        Operation::Update {
            namespace: namespace.into(),
            flags: 0,
            selector,
            update,
            concern: WriteConcern::Acknowledged,
            check_keys: true,
        }
    }

    pub fn delete(namespace: impl Into<String>, selector: Document) -> Self {
        Operation::Delete {
            namespace: namespace.into(),
            flags: 0,
            selector,
            concern: WriteConcern::Acknowledged,
        }
    }

    pub fn get_more(namespace: impl Into<String>, cursor_id: i64, limit: i32) -> Self {
        Operation::GetMore {
            namespace: namespace.into(),
            limit,
            cursor_id,
        }
    }

    pub fn kill_cursors(cursor_ids: Vec<i64>) -> Self {
        Operation::KillCursors { cursor_ids }
    }

    pub fn command(database: impl Into<String>, command: Document) -> Self {
        Operation::Command {
            database: database.into(),
            command,
        }
    }

    /// The status check chained after an acknowledged write.
    pub fn last_error(database: impl Into<String>) -> Self {
        Operation::command(database, doc! { "getlasterror": 1 })
    }

    pub fn with_flags(mut self, value: i32) -> Self {
        match &mut self {
            Operation::Query { flags, .. }
            | Operation::Insert { flags, .. }
            | Operation::Update { flags, .. }
            | Operation::Delete { flags, .. } => *flags |= value,
            Operation::GetMore { .. } | Operation::KillCursors { .. } | Operation::Command { .. } => {}
        }
        self
    }

    pub fn with_concern(mut self, value: WriteConcern) -> Self {
        match &mut self {
            Operation::Insert { concern, .. }
            | Operation::Update { concern, .. }
            | Operation::Delete { concern, .. } => *concern = value,
            _ => {}
        }
        self
    }

    pub fn acknowledged(self) -> Self {
        self.with_concern(WriteConcern::Acknowledged)
    }

    pub fn unacknowledged(self) -> Self {
        self.with_concern(WriteConcern::Unacknowledged)
    }

    pub fn with_check_keys(mut self, value: bool) -> Self {
        match &mut self {
            Operation::Insert { check_keys, .. } | Operation::Update { check_keys, .. } => {
                *check_keys = value
            }
            _ => {}
        }
        self
    }

    pub fn with_skip(mut self, value: i32) -> Self {
        if let Operation::Query { skip, .. } = &mut self {
            *skip = value;
        }
        self
    }

    /// `numberToReturn`: 0 lets the server pick, negative closes the cursor
    /// after one batch.
    pub fn with_limit(mut self, value: i32) -> Self {
        if let Operation::Query { limit, .. } | Operation::GetMore { limit, .. } = &mut self {
            *limit = value;
        }
        self
    }

    pub fn with_fields(mut self, value: Document) -> Self {
        if let Operation::Query { fields, .. } = &mut self {
            *fields = Some(value);
        }
        self
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Operation::Query { .. } | Operation::Command { .. } => OpCode::Query,
            Operation::Insert { .. } => OpCode::Insert,
            Operation::Update { .. } => OpCode::Update,
            Operation::Delete { .. } => OpCode::Delete,
            Operation::GetMore { .. } => OpCode::GetMore,
            Operation::KillCursors { .. } => OpCode::KillCursors,
        }
    }

    /// Namespace written into the frame, if the op code carries one.
    pub fn namespace(&self) -> Option<String> {
        match self {
            Operation::Query { namespace, .. }
            | Operation::Insert { namespace, .. }
            | Operation::Update { namespace, .. }
            | Operation::Delete { namespace, .. }
            | Operation::GetMore { namespace, .. } => Some(namespace.clone()),
            Operation::Command { database, .. } => Some(format!("{database}.$cmd")),
            Operation::KillCursors { .. } => None,
        }
    }

    /// Database the operation targets: the namespace up to the first `.`.
    pub fn database(&self) -> Option<String> {
        match self {
            Operation::Command { database, .. } => Some(database.clone()),
            _ => self
                .namespace()
                .map(|ns| ns.split('.').next().unwrap_or_default().to_string()),
        }
    }

    /// True when the server answers this op code with an OP_REPLY.
    pub fn expects_reply(&self) -> bool {
        matches!(self.op_code(), OpCode::Query | OpCode::GetMore)
    }

    pub fn concern(&self) -> WriteConcern {
        match self {
            Operation::Insert { concern, .. }
            | Operation::Update { concern, .. }
            | Operation::Delete { concern, .. } => *concern,
            _ => WriteConcern::Unacknowledged,
        }
    }

    /// Encode into a complete frame with `responseTo = 0`.
    pub fn encode(&self, request_id: i32) -> Result<Vec<u8>, CodecError> {
        let mut frame = FrameBuilder::new(self.op_code(), request_id, 0);

        match self {
            Operation::Query {
                namespace,
                flags,
                skip,
                limit,
                query,
                fields,
            } => {
                frame
                    .put_i32(*flags)
                    .put_cstring(namespace)?
                    .put_i32(*skip)
                    .put_i32(*limit)
                    .put_document(query)?;
                if let Some(fields) = fields {
                    frame.put_document(fields)?;
                }
            }
            Operation::Command { database, command } => {
                frame
                    .put_i32(0)
                    .put_cstring(&format!("{database}.$cmd"))?
                    .put_i32(0)
                    .put_i32(-1)
                    .put_document(command)?;
            }
            Operation::Insert {
                namespace,
                flags,
                documents,
                check_keys: check,
                ..
            } => {
                if documents.is_empty() {
                    return Err(CodecError::Empty("insert"));
                }
                frame.put_i32(*flags).put_cstring(namespace)?;
                for doc in documents {
                    if *check {
                        check_keys(doc)?;
                    }
                    frame.put_document(doc)?;
                }
            }
            Operation::Update {
                namespace,
                flags,
                selector,
                update,
                check_keys: check,
                ..
            } => {
                let is_operator = update.keys().next().is_some_and(|k| k.starts_with('$'));
                if *check && !is_operator {
                    check_keys(update)?;
                }
                frame
                    .put_i32(0)
                    .put_cstring(namespace)?
                    .put_i32(*flags)
                    .put_document(selector)?
                    .put_document(update)?;
            }
            Operation::Delete {
                namespace,
                flags,
                selector,
                ..
            } => {
                frame
                    .put_i32(0)
                    .put_cstring(namespace)?
                    .put_i32(*flags)
                    .put_document(selector)?;
            }
            Operation::GetMore {
                namespace,
                limit,
                cursor_id,
            } => {
                frame
                    .put_i32(0)
                    .put_cstring(namespace)?
                    .put_i32(*limit)
                    .put_i64(*cursor_id);
            }
            Operation::KillCursors { cursor_ids } => {
                if cursor_ids.is_empty() {
                    return Err(CodecError::Empty("kill cursors"));
                }
                frame.put_i32(0).put_i32(cursor_ids.len() as i32);
                for id in cursor_ids {
                    frame.put_i64(*id);
                }
            }
        }

        frame.finish()
    }

    /// Decode a request frame, as a server would.
    ///
    /// Neither the write concern nor key checking is carried on the wire, so
    /// decoded writes come back unacknowledged with key checking off. Queries
    /// against `<db>.$cmd` decode as [`Operation::Command`].
    pub fn decode(frame: &[u8]) -> Result<(MsgHeader, Operation), CodecError> {
        let header = MsgHeader::parse(frame)?;
        let mut body = BodyReader::new(frame);

        let op = match header.op()? {
            OpCode::Query => {
                let flags = body.read_i32()?;
                let namespace = body.read_cstring()?;
                let skip = body.read_i32()?;
                let limit = body.read_i32()?;
                let query = body.read_document()?;
                let fields = match body.remaining() {
                    0 => None,
                    _ => Some(body.read_document()?),
                };

                let command_db = namespace.strip_suffix(".$cmd").map(str::to_string);
                match command_db {
                    Some(database) if flags == 0 && skip == 0 && limit == -1 && fields.is_none() => {
                        Operation::Command {
                            database,
                            command: query,
                        }
                    }
                    _ => Operation::Query {
                        namespace,
                        flags,
                        skip,
                        limit,
                        query,
                        fields,
                    },
                }
            }
            OpCode::Insert => {
                let flags = body.read_i32()?;
                let namespace = body.read_cstring()?;
                let mut documents = Vec::new();
                while body.remaining() > 0 {
                    documents.push(body.read_document()?);
                }
                Operation::Insert {
                    namespace,
                    flags,
                    documents,
                    concern: WriteConcern::Unacknowledged,
                    check_keys: false,
                }
            }
            OpCode::Update => {
                body.read_i32()?;
                let namespace = body.read_cstring()?;
                let flags = body.read_i32()?;
                let selector = body.read_document()?;
                let update = body.read_document()?;
                Operation::Update {
                    namespace,
                    flags,
                    selector,
                    update,
                    concern: WriteConcern::Unacknowledged,
                    check_keys: false,
                }
            }
            OpCode::Delete => {
                body.read_i32()?;
                let namespace = body.read_cstring()?;
                let flags = body.read_i32()?;
                let selector = body.read_document()?;
                Operation::Delete {
                    namespace,
                    flags,
                    selector,
                    concern: WriteConcern::Unacknowledged,
                }
            }
            OpCode::GetMore => {
                body.read_i32()?;
                let namespace = body.read_cstring()?;
                let limit = body.read_i32()?;
                let cursor_id = body.read_i64()?;
                Operation::GetMore {
                    namespace,
                    limit,
                    cursor_id,
                }
            }
            OpCode::KillCursors => {
                body.read_i32()?;
                let count = body.read_i32()?;
                let cursor_ids = (0..count.max(0))
                    .map(|_| body.read_i64())
                    .collect::<Result<Vec<_>, _>>()?;
                Operation::KillCursors { cursor_ids }
            }
            op @ OpCode::Reply => return Err(CodecError::UnexpectedOpCode(op)),
        };

        body.finish()?;
        Ok((header, op))
    }
}

#[cfg(test)]
mod tests {
    use bson::oid::ObjectId;

    use crate::protocol::MAX_MESSAGE_SIZE;

    use super::*;

    fn round_trip(op: Operation) -> Operation {
        let frame = op.encode(42).unwrap();
        let (header, decoded) = Operation::decode(&frame).unwrap();

        assert_eq!(header.request_id, 42);
        assert_eq!(header.response_to, 0);
        assert_eq!(header.message_length as usize, frame.len());
        assert_eq!(header.op_code, op.op_code() as i32);
        decoded
    }

    #[test]
    fn insert_preserves_namespace_flags_and_documents() {
        let docs = vec![
            doc! { "_id": ObjectId::new(), "name": "a" },
            doc! { "_id": 2, "nested": { "tags": ["x", "y"] } },
        ];
        let op = Operation::insert("test.articles", docs.clone())
            .with_flags(flags::CONTINUE_ON_ERROR);

        match round_trip(op) {
            Operation::Insert {
                namespace,
                flags: op_flags,
                documents,
                ..
            } => {
                assert_eq!(namespace, "test.articles");
                assert_eq!(op_flags, flags::CONTINUE_ON_ERROR);
                assert_eq!(documents, docs);
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn update_and_delete_keep_flags() {
        let update = Operation::update(
            "test.c",
            doc! { "_id": 1 },
            doc! { "$set": { "name": "b" } },
        )
        .with_flags(flags::UPSERT | flags::MULTI_UPDATE)
        .unacknowledged();
        assert_eq!(round_trip(update.clone()), update.with_check_keys(false));

        let delete = Operation::delete("test.c", doc! { "name": "b" })
            .with_flags(flags::SINGLE_REMOVE)
            .unacknowledged();
        assert_eq!(round_trip(delete.clone()), delete);
    }

    #[test]
    fn query_with_projection_round_trips() {
        let query = Operation::query("test.c", doc! { "comment.author": "joe" })
            .with_flags(flags::NO_CURSOR_TIMEOUT | flags::SLAVE_OK)
            .with_skip(3)
            .with_limit(-1)
            .with_fields(doc! { "comment.$.author": 1 });

        assert_eq!(round_trip(query.clone()), query);
    }

    #[test]
    fn command_targets_cmd_namespace() {
        let op = Operation::command("test", doc! { "count": "c" });
        let frame = op.encode(1).unwrap();

        // flags, then the namespace as a C string
        assert_eq!(&frame[20..29], b"test.$cmd");
        assert_eq!(frame[29], 0);
        assert_eq!(round_trip(op.clone()), op);
    }

    #[test]
    fn cursor_operations_round_trip() {
        let more = Operation::get_more("test.c", 99, 10);
        assert_eq!(round_trip(more.clone()), more);

        let kill = Operation::kill_cursors(vec![1, 2, i64::MAX]);
        assert_eq!(round_trip(kill.clone()), kill);
    }

    #[test]
    fn encoding_is_deterministic() {
        let op = Operation::insert("test.c", vec![doc! { "_id": 1, "a": "b" }]);
        assert_eq!(op.encode(5).unwrap(), op.encode(5).unwrap());
    }

    #[test]
    #[should_panic(expected = "InvalidKey")]
    fn insert_rejects_dollar_keys() {
        Operation::insert("test.c", vec![doc! { "$where": "1" }])
            .encode(1)
            .unwrap();
    }

    #[test]
    fn insert_skips_key_check_when_disabled() {
        let op = Operation::insert("test.c", vec![doc! { "a.b": 1 }]).with_check_keys(false);
        assert!(op.encode(1).is_ok());
    }

    #[test]
    fn operator_updates_are_not_key_checked() {
        let op = Operation::update("test.c", doc! {}, doc! { "$set": { "a.b": 1 } });
        assert!(op.encode(1).is_ok());

        let replace = Operation::update("test.c", doc! {}, doc! { "a.b": 1 });
        assert!(matches!(replace.encode(1), Err(CodecError::InvalidKey(_))));
    }

    #[test]
    fn empty_insert_is_rejected() {
        assert!(matches!(
            Operation::insert("test.c", vec![]).encode(1),
            Err(CodecError::Empty("insert"))
        ));
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let big = "x".repeat(MAX_MESSAGE_SIZE + 1_000_000);
        let insert = Operation::insert("t.c", vec![doc! { "_id": 1, "b": big }]);

        assert!(matches!(
            insert.encode(1),
            Err(CodecError::FrameTooLarge { max: MAX_MESSAGE_SIZE, .. })
        ));
    }

    #[test]
    fn write_concern_only_applies_to_writes() {
        assert_eq!(
            Operation::insert("test.c", vec![]).concern(),
            WriteConcern::Acknowledged
        );
        assert_eq!(
            Operation::query("test.c", doc! {}).acknowledged().concern(),
            WriteConcern::Unacknowledged
        );
        assert_eq!(Operation::query("test.c", doc! {}).database().unwrap(), "test");
    }
}
