use bincode::{Decode, Encode};
use bson::{Bson, Document};

use super::wire::{BodyReader, CodecError, FrameBuilder, MsgHeader, OpCode};

pub mod flags {
    pub const CURSOR_NOT_FOUND: i32 = 1;
    pub const QUERY_FAILURE: i32 = 1 << 1;
    pub const SHARD_CONFIG_STALE: i32 = 1 << 2;
    pub const AWAIT_CAPABLE: i32 = 1 << 3;
}

const PREAMBLE_SIZE: usize = 20;

/// Fixed-width fields that open every OP_REPLY body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
struct ReplyPreamble {
    response_flags: i32,
    cursor_id: i64,
    starting_from: i32,
    number_returned: i32,
}

/// A decoded OP_REPLY.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents,
            ..Default::default()
        }
    }

    pub fn with_cursor(mut self, cursor_id: i64, starting_from: i32) -> Self {
        self.cursor_id = cursor_id;
        self.starting_from = starting_from;
        self
    }

    pub fn with_flags(mut self, flags: i32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn cursor_not_found(&self) -> bool {
        self.flags & flags::CURSOR_NOT_FOUND != 0
    }

    pub fn query_failure(&self) -> bool {
        self.flags & flags::QUERY_FAILURE != 0
    }

    pub fn first(&self) -> Option<&Document> {
        self.documents.first()
    }

    pub fn into_first(self) -> Option<Document> {
        self.documents.into_iter().next()
    }

    /// Decode a complete OP_REPLY frame.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let header = MsgHeader::parse(frame)?;
        match header.op()? {
            OpCode::Reply => {}
            op => return Err(CodecError::UnexpectedOpCode(op)),
        }

        let mut body = BodyReader::new(frame);
        let preamble: ReplyPreamble = body.read_fixed(PREAMBLE_SIZE)?;

        let mut documents = Vec::with_capacity(preamble.number_returned.clamp(0, 1024) as usize);
        while body.remaining() > 0 {
            documents.push(body.read_document()?);
        }
        if documents.len() != preamble.number_returned.max(0) as usize {
            return Err(CodecError::DocumentCount {
                declared: preamble.number_returned,
                actual: documents.len(),
            });
        }

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags: preamble.response_flags,
            cursor_id: preamble.cursor_id,
            starting_from: preamble.starting_from,
            documents,
        })
    }

    /// Encode as an OP_REPLY answering `response_to`.
    pub fn encode(&self, request_id: i32, response_to: i32) -> Result<Vec<u8>, CodecError> {
        let mut frame = FrameBuilder::new(OpCode::Reply, request_id, response_to);
        frame.put_fixed(ReplyPreamble {
            response_flags: self.flags,
            cursor_id: self.cursor_id,
            starting_from: self.starting_from,
            number_returned: self.documents.len() as i32,
        })?;
        for doc in &self.documents {
            frame.put_document(doc)?;
        }
        frame.finish()
    }
}

/// Interpret the `ok` field of a command reply; numeric or boolean.
pub fn is_ok(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}

/// Read an integer field regardless of the numeric type the server chose.
pub fn get_int(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key)? {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) => Some(*v as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn reply_round_trips() {
        let reply = Reply::new(vec![doc! { "ok": 1.0 }, doc! { "n": 2 }])
            .with_cursor(77, 4)
            .with_flags(flags::AWAIT_CAPABLE);
        let frame = reply.encode(9, 3).unwrap();
        let decoded = Reply::decode(&frame).unwrap();

        assert_eq!(decoded.request_id, 9);
        assert_eq!(decoded.response_to, 3);
        assert_eq!(decoded.cursor_id, 77);
        assert_eq!(decoded.starting_from, 4);
        assert_eq!(decoded.flags, flags::AWAIT_CAPABLE);
        assert_eq!(decoded.documents, reply.documents);
    }

    #[test]
    fn empty_reply_decodes_to_no_documents() {
        let frame = Reply::default().encode(1, 1).unwrap();
        let decoded = Reply::decode(&frame).unwrap();

        assert!(decoded.documents.is_empty());
        assert_eq!(decoded.first(), None);
    }

    #[test]
    fn truncated_reply_is_an_error() {
        let frame = Reply::new(vec![doc! { "a": 1 }]).encode(1, 1).unwrap();
        let mut cut = frame[..frame.len() - 3].to_vec();
        let len = cut.len() as i32;
        cut[..4].copy_from_slice(&len.to_le_bytes());

        assert!(matches!(Reply::decode(&cut), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn declared_length_must_match() {
        let frame = Reply::new(vec![doc! { "a": 1 }]).encode(1, 1).unwrap();

        assert!(matches!(
            Reply::decode(&frame[..frame.len() - 1]),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn document_count_must_match() {
        let mut frame = Reply::new(vec![doc! { "a": 1 }]).encode(1, 1).unwrap();
        // numberReturned sits at the end of the preamble
        frame[32..36].copy_from_slice(&2i32.to_le_bytes());

        assert!(matches!(
            Reply::decode(&frame),
            Err(CodecError::DocumentCount { declared: 2, actual: 1 })
        ));
    }

    #[test]
    fn request_frames_are_not_replies() {
        let frame = crate::protocol::Operation::query("test.c", doc! {})
            .encode(1)
            .unwrap();

        assert!(matches!(
            Reply::decode(&frame),
            Err(CodecError::UnexpectedOpCode(OpCode::Query))
        ));
    }

    #[test]
    fn ok_accepts_any_numeric_type() {
        assert!(is_ok(&doc! { "ok": 1.0 }));
        assert!(is_ok(&doc! { "ok": 1 }));
        assert!(!is_ok(&doc! { "ok": 0.0 }));
        assert!(!is_ok(&doc! {}));
        assert_eq!(get_int(&doc! { "n": 3.0 }, "n"), Some(3));
    }
}
