//! Packet framing.
//!
//! # Responsibilities
//! - Read exactly one packet from an async byte stream
//! - Serialize packets into a single contiguous buffer
//! - Reject malformed framing before anything reaches a worker

use tokio::io::{AsyncRead, AsyncReadExt};

use super::op::{ErrorCode, Op};
use super::ski::{Digest, Ski, DIGEST_LEN, SKI_LEN};

pub const VERSION_MAJOR: u8 = 0x01;
pub const VERSION_MINOR: u8 = 0x00;
pub const HEADER_SIZE: usize = 8;

const TAG_DIGEST: u8 = 0x01;
const TAG_SKI: u8 = 0x04;
const TAG_OPCODE: u8 = 0x11;
const TAG_PAYLOAD: u8 = 0x12;
const TAG_ERROR: u8 = 0x13;
const TAG_PADDING: u8 = 0x20;

const ITEM_HEADER_SIZE: usize = 3;

/// Largest payload a response (opcode item + payload item) can carry.
pub const MAX_RESPONSE_PAYLOAD: usize = u16::MAX as usize - 2 * ITEM_HEADER_SIZE - 1;

/// Framing or transport failure while reading or writing a packet.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer closed the stream cleanly between packets.
    #[error("connection closed by peer")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported protocol version {major}.{minor}")]
    VersionMismatch { major: u8, minor: u8 },
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("operation of {size} bytes exceeds the {limit}-byte limit")]
    TooLarge { size: usize, limit: usize },
}

/// Fixed-size packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub major: u8,
    pub minor: u8,
    /// Length in bytes of the encoded operation that follows.
    pub length: u16,
    /// Correlation ID, echoed by the response.
    pub id: u32,
}

/// Opcode-tagged body of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub opcode: Op,
    pub ski: Option<Ski>,
    pub digest: Option<Digest>,
    pub payload: Vec<u8>,
    /// Set on responses that report a failure.
    pub error: Option<ErrorCode>,
}

/// A header plus the operation it frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub operation: Operation,
}

impl Operation {
    pub fn new(opcode: Op, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            ski: None,
            digest: None,
            payload,
            error: None,
        }
    }

    /// An error response for `opcode`.
    pub fn error(opcode: Op, code: ErrorCode) -> Self {
        Self {
            opcode,
            ski: None,
            digest: None,
            payload: Vec::new(),
            error: Some(code),
        }
    }

    pub fn with_key(mut self, ski: Ski, digest: Option<Digest>) -> Self {
        self.ski = Some(ski);
        self.digest = digest;
        self
    }

    /// Encoded size in bytes.
    pub fn bytes(&self) -> usize {
        let mut size = ITEM_HEADER_SIZE + 1;
        if self.ski.is_some() {
            size += ITEM_HEADER_SIZE + SKI_LEN;
        }
        if self.digest.is_some() {
            size += ITEM_HEADER_SIZE + DIGEST_LEN;
        }
        if !self.payload.is_empty() {
            size += ITEM_HEADER_SIZE + self.payload.len();
        }
        if self.error.is_some() {
            size += ITEM_HEADER_SIZE + 1;
        }
        size
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_item(buf, TAG_OPCODE, &[self.opcode.to_byte()]);
        if let Some(ski) = &self.ski {
            put_item(buf, TAG_SKI, ski.as_bytes());
        }
        if let Some(digest) = &self.digest {
            put_item(buf, TAG_DIGEST, digest.as_bytes());
        }
        if !self.payload.is_empty() {
            put_item(buf, TAG_PAYLOAD, &self.payload);
        }
        if let Some(code) = self.error {
            put_item(buf, TAG_ERROR, &[code.to_byte()]);
        }
    }

    fn decode(mut body: &[u8]) -> Result<Self, ProtocolError> {
        let mut opcode = None;
        let mut op = Operation::new(Op::Ping, Vec::new());

        while !body.is_empty() {
            if body.len() < ITEM_HEADER_SIZE {
                return Err(ProtocolError::Malformed("truncated item header".into()));
            }
            let tag = body[0];
            let len = u16::from_be_bytes([body[1], body[2]]) as usize;
            body = &body[ITEM_HEADER_SIZE..];
            if body.len() < len {
                return Err(ProtocolError::Malformed(format!(
                    "item 0x{:02x} declares {} bytes, {} remain",
                    tag,
                    len,
                    body.len()
                )));
            }
            let (data, rest) = body.split_at(len);
            body = rest;

            match tag {
                TAG_OPCODE => {
                    let [b] = data else {
                        return Err(ProtocolError::Malformed("opcode must be one byte".into()));
                    };
                    opcode = Some(Op::from_byte(*b));
                }
                TAG_SKI => {
                    op.ski = Some(Ski::from_slice(data).ok_or_else(|| {
                        ProtocolError::Malformed(format!("SKI must be {} bytes", SKI_LEN))
                    })?);
                }
                TAG_DIGEST => {
                    op.digest = Some(Digest::from_slice(data).ok_or_else(|| {
                        ProtocolError::Malformed(format!("digest must be {} bytes", DIGEST_LEN))
                    })?);
                }
                TAG_PAYLOAD => op.payload = data.to_vec(),
                TAG_ERROR => {
                    let [b] = data else {
                        return Err(ProtocolError::Malformed("error code must be one byte".into()));
                    };
                    op.error = Some(ErrorCode::from_byte(*b));
                }
                TAG_PADDING => {}
                other => {
                    return Err(ProtocolError::Malformed(format!("unknown tag 0x{:02x}", other)));
                }
            }
        }

        op.opcode = opcode.ok_or_else(|| ProtocolError::Malformed("missing opcode".into()))?;
        Ok(op)
    }
}

fn put_item(buf: &mut Vec<u8>, tag: u8, data: &[u8]) {
    buf.push(tag);
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
}

impl Packet {
    /// Frame `operation` under correlation ID `id`.
    pub fn new(id: u32, operation: Operation) -> Result<Self, ProtocolError> {
        let size = operation.bytes();
        let length = u16::try_from(size).map_err(|_| ProtocolError::TooLarge {
            size,
            limit: u16::MAX as usize,
        })?;
        Ok(Self {
            header: Header {
                major: VERSION_MAJOR,
                minor: VERSION_MINOR,
                length,
                id,
            },
            operation,
        })
    }

    pub fn id(&self) -> u32 {
        self.header.id
    }

    pub fn opcode(&self) -> Op {
        self.operation.opcode
    }

    /// Serialize header and operation into one buffer.
    ///
    /// Fails only when the header length disagrees with the operation, which
    /// cannot happen for packets built through [`Packet::new`].
    pub fn marshal_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        let size = self.operation.bytes();
        if size > u16::MAX as usize {
            return Err(ProtocolError::TooLarge {
                size,
                limit: u16::MAX as usize,
            });
        }
        if size != self.header.length as usize {
            return Err(ProtocolError::Malformed(format!(
                "header length {} does not match operation size {}",
                self.header.length, size
            )));
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + size);
        buf.push(self.header.major);
        buf.push(self.header.minor);
        buf.extend_from_slice(&self.header.length.to_be_bytes());
        buf.extend_from_slice(&self.header.id.to_be_bytes());
        self.operation.encode_into(&mut buf);
        Ok(buf)
    }

    /// Read exactly one packet.
    ///
    /// A stream that ends before the first header byte yields
    /// [`ProtocolError::Closed`]; ending anywhere later is an I/O error.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut head = [0u8; HEADER_SIZE];
        let n = reader.read(&mut head).await?;
        if n == 0 {
            return Err(ProtocolError::Closed);
        }
        reader.read_exact(&mut head[n..]).await?;

        let header = Header {
            major: head[0],
            minor: head[1],
            length: u16::from_be_bytes([head[2], head[3]]),
            id: u32::from_be_bytes([head[4], head[5], head[6], head[7]]),
        };
        if header.major != VERSION_MAJOR {
            return Err(ProtocolError::VersionMismatch {
                major: header.major,
                minor: header.minor,
            });
        }

        let mut body = vec![0u8; header.length as usize];
        reader.read_exact(&mut body).await?;
        let operation = Operation::decode(&body)?;

        Ok(Self { header, operation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marshal_then_read() {
        let op = Operation::new(Op::EcdsaSignSha256, vec![9; 32])
            .with_key(Ski([1; SKI_LEN]), Some(Digest([2; DIGEST_LEN])));
        let pkt = Packet::new(42, op).unwrap();
        let bytes = pkt.marshal_binary().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + pkt.header.length as usize);

        let mut reader = &bytes[..];
        let decoded = Packet::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded, pkt);
    }

    #[tokio::test]
    async fn error_response_keeps_opcode() {
        let pkt = Packet::new(7, Operation::error(Op::RsaSignSha256, ErrorCode::KeyNotFound)).unwrap();
        let bytes = pkt.marshal_binary().unwrap();
        let decoded = Packet::read_from(&mut &bytes[..]).await.unwrap();
        assert_eq!(decoded.opcode(), Op::RsaSignSha256);
        assert_eq!(decoded.operation.error, Some(ErrorCode::KeyNotFound));
        assert!(decoded.operation.payload.is_empty());
    }

    #[tokio::test]
    async fn empty_stream_is_clean_close() {
        let mut reader: &[u8] = &[];
        assert!(matches!(
            Packet::read_from(&mut reader).await,
            Err(ProtocolError::Closed)
        ));
    }

    #[tokio::test]
    async fn truncated_header_is_io_error() {
        let mut reader: &[u8] = &[VERSION_MAJOR, 0, 0];
        assert!(matches!(
            Packet::read_from(&mut reader).await,
            Err(ProtocolError::Io(_))
        ));
    }

    #[tokio::test]
    async fn wrong_major_version_rejected() {
        let mut bytes = Packet::new(1, Operation::new(Op::Ping, vec![]))
            .unwrap()
            .marshal_binary()
            .unwrap();
        bytes[0] = 0x02;
        assert!(matches!(
            Packet::read_from(&mut &bytes[..]).await,
            Err(ProtocolError::VersionMismatch { major: 2, .. })
        ));
    }

    #[tokio::test]
    async fn unknown_opcode_still_decodes() {
        let bytes = Packet::new(3, Operation::new(Op::Unknown(0x77), b"x".to_vec()))
            .unwrap()
            .marshal_binary()
            .unwrap();
        let decoded = Packet::read_from(&mut &bytes[..]).await.unwrap();
        assert_eq!(decoded.opcode(), Op::Unknown(0x77));
    }

    #[tokio::test]
    async fn missing_opcode_is_malformed() {
        // header + a lone padding item
        let bytes = [VERSION_MAJOR, 0, 0, 3, 0, 0, 0, 1, TAG_PADDING, 0, 0];
        assert!(matches!(
            Packet::read_from(&mut &bytes[..]).await,
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_operation_rejected() {
        let op = Operation::new(Op::Ping, vec![0; u16::MAX as usize]);
        assert!(matches!(Packet::new(1, op), Err(ProtocolError::TooLarge { .. })));
    }
}
