use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
    decode_from_slice, encode_into_std_write,
};
use bson::{Bson, Document};
use thiserror::Error;

/// Size of [`MsgHeader`] on the wire.
pub const HEADER_SIZE: usize = 16;

/// Largest frame either side will accept.
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode fixed-width fields: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode fixed-width fields: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("failed to encode document: {0}")]
    Document(#[from] bson::ser::Error),
    #[error("failed to decode document: {0}")]
    ParseDocument(#[from] bson::de::Error),
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("declared length {declared} does not match frame length {actual}")]
    LengthMismatch { declared: i32, actual: usize },
    #[error("unknown op code {0}")]
    UnknownOpCode(i32),
    #[error("unexpected op code {0:?}")]
    UnexpectedOpCode(OpCode),
    #[error("invalid namespace '{0}'")]
    InvalidNamespace(String),
    #[error("key '{0}' must not start with '$' or contain '.'")]
    InvalidKey(String),
    #[error("reply declared {declared} documents but carried {actual}")]
    DocumentCount { declared: i32, actual: usize },
    #[error("{0} carries no documents")]
    Empty(&'static str),
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
}

/// Legacy wire protocol op codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl TryFrom<i32> for OpCode {
    type Error = CodecError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            code => Err(CodecError::UnknownOpCode(code)),
        }
    }
}

/// Standard message header that prefixes every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct MsgHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MsgHeader {
    /// Parse the header of a complete frame, checking the declared length.
    pub fn parse(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                available: frame.len(),
            });
        }

        let (header, _): (MsgHeader, usize) = decode_from_slice(&frame[..HEADER_SIZE], config())?;
        if header.message_length < 0 || header.message_length as usize != frame.len() {
            return Err(CodecError::LengthMismatch {
                declared: header.message_length,
                actual: frame.len(),
            });
        }
        Ok(header)
    }

    pub fn op(&self) -> Result<OpCode, CodecError> {
        OpCode::try_from(self.op_code)
    }
}

/// Little-endian, fixed-width integers: exactly the wire layout.
pub(crate) fn config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Accumulates one frame. The header is patched in by [`FrameBuilder::finish`]
/// once the body length is known.
pub(crate) struct FrameBuilder {
    buf: Vec<u8>,
    request_id: i32,
    response_to: i32,
    op_code: OpCode,
}

impl FrameBuilder {
    pub fn new(op_code: OpCode, request_id: i32, response_to: i32) -> Self {
        Self {
            buf: vec![0; HEADER_SIZE],
            request_id,
            response_to,
            op_code,
        }
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a fixed-width struct (bincode layout matches the wire layout).
    pub fn put_fixed<T: Encode>(&mut self, value: T) -> Result<&mut Self, CodecError> {
        encode_into_std_write(value, &mut self.buf, config())?;
        Ok(self)
    }

    pub fn put_cstring(&mut self, value: &str) -> Result<&mut Self, CodecError> {
        if value.is_empty() || value.contains('\0') {
            return Err(CodecError::InvalidNamespace(value.to_string()));
        }
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        Ok(self)
    }

    pub fn put_document(&mut self, doc: &Document) -> Result<&mut Self, CodecError> {
        doc.to_writer(&mut self.buf)?;
        Ok(self)
    }

    pub fn finish(mut self) -> Result<Vec<u8>, CodecError> {
        if self.buf.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: self.buf.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let header = MsgHeader {
            message_length: self.buf.len() as i32,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: self.op_code as i32,
        };

        let mut head = Vec::with_capacity(HEADER_SIZE);
        encode_into_std_write(header, &mut head, config())?;
        self.buf[..HEADER_SIZE].copy_from_slice(&head);
        Ok(self.buf)
    }
}

/// Cursor over the body of a frame that has already passed [`MsgHeader::parse`].
pub(crate) struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(frame: &'a [u8]) -> Self {
        Self {
            buf: frame,
            pos: HEADER_SIZE,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    /// Decode a fixed-width struct (bincode layout matches the wire layout).
    pub fn read_fixed<T: Decode<()>>(&mut self, size: usize) -> Result<T, CodecError> {
        let bytes = self.take(size)?;
        let (value, _) = decode_from_slice(bytes, config())?;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    pub fn read_cstring(&mut self) -> Result<String, CodecError> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(CodecError::Truncated {
                needed: rest.len() + 1,
                available: rest.len(),
            })?;
        let value = std::str::from_utf8(&rest[..end])
            .map_err(|_| CodecError::InvalidNamespace(String::from_utf8_lossy(&rest[..end]).into()))?
            .to_string();
        self.pos += end + 1;
        Ok(value)
    }

    pub fn read_document(&mut self) -> Result<Document, CodecError> {
        // Documents are self-delimiting: the first four bytes hold their size.
        let rest = &self.buf[self.pos..];
        if rest.len() < 4 {
            return Err(CodecError::Truncated {
                needed: 4,
                available: rest.len(),
            });
        }
        let size = i32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
        if size < 5 {
            return Err(CodecError::Truncated {
                needed: 5,
                available: size.max(0) as usize,
            });
        }
        let bytes = self.take(size as usize)?;
        Ok(Document::from_reader(bytes)?)
    }

    pub fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

/// Reject keys that would be interpreted as operators or paths by the server.
pub fn check_keys(doc: &Document) -> Result<(), CodecError> {
    for (key, value) in doc {
        if key.starts_with('$') || key.contains('.') {
            return Err(CodecError::InvalidKey(key.clone()));
        }
        check_value(value)?;
    }
    Ok(())
}

fn check_value(value: &Bson) -> Result<(), CodecError> {
    match value {
        Bson::Document(doc) => check_keys(doc),
        Bson::Array(items) => items.iter().try_for_each(check_value),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let mut builder = FrameBuilder::new(OpCode::Query, 7, 0);
        builder.put_i32(-1);
        let frame = builder.finish().unwrap();

        assert_eq!(
            frame,
            vec![20, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 0xd4, 0x07, 0, 0, 0xff, 0xff, 0xff, 0xff]
        );
        let header = MsgHeader::parse(&frame).unwrap();
        assert_eq!(header.request_id, 7);
        assert_eq!(header.op().unwrap(), OpCode::Query);
    }

    #[test]
    fn header_rejects_length_mismatch() {
        let mut frame = FrameBuilder::new(OpCode::Reply, 1, 1).finish().unwrap();
        frame.push(0);

        assert!(matches!(
            MsgHeader::parse(&frame),
            Err(CodecError::LengthMismatch { declared: 16, actual: 17 })
        ));
    }

    #[test]
    fn header_rejects_short_frame() {
        assert!(matches!(
            MsgHeader::parse(&[1, 2, 3]),
            Err(CodecError::Truncated { needed: 16, available: 3 })
        ));
    }

    #[test]
    fn namespace_must_not_contain_nul() {
        let mut builder = FrameBuilder::new(OpCode::Insert, 1, 0);
        assert!(matches!(
            builder.put_cstring("db.co\0ll"),
            Err(CodecError::InvalidNamespace(_))
        ));
    }

    #[test]
    fn check_keys_rejects_nested_operators() {
        assert!(check_keys(&doc! { "name": "a", "tags": ["x"] }).is_ok());
        assert!(matches!(
            check_keys(&doc! { "$set": { "a": 1 } }),
            Err(CodecError::InvalidKey(k)) if k == "$set"
        ));
        assert!(matches!(
            check_keys(&doc! { "a": [{ "b.c": 1 }] }),
            Err(CodecError::InvalidKey(k)) if k == "b.c"
        ));
    }
}
