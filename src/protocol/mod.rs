//! Keyless wire protocol.
//!
//! # Data Flow
//! ```text
//! Byte stream
//!     → packet.rs (8-byte header, then TLV-encoded operation)
//!     → op.rs (opcode + error code tables)
//!     → ski.rs (key identifiers carried in requests)
//!
//! Packet layout (big-endian):
//!     major u8 | minor u8 | length u16 | id u32 | items[length]
//! Item layout:
//!     tag u8 | len u16 | data[len]
//! ```
//!
//! # Design Decisions
//! - Unknown opcodes still decode so the server can answer with an error
//!   instead of dropping the connection
//! - Responses carry the request opcode; failures are marked by an error item
//! - Encoding is checked: anything that does not fit a u16 length is rejected

pub mod op;
pub mod packet;
pub mod ski;

pub use op::{ErrorCode, Op, PoolClass};
pub use packet::{Header, Operation, Packet, ProtocolError, HEADER_SIZE, VERSION_MAJOR, VERSION_MINOR};
pub use ski::{spki_from_cert_der, Digest, KeyParseError, Ski};
