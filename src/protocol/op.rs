//! Opcodes and remote error codes.

use std::fmt;

/// Operation requested by a packet (and echoed by its response).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    RsaDecrypt,
    RsaSignMd5Sha1,
    RsaSignSha1,
    RsaSignSha224,
    RsaSignSha256,
    RsaSignSha384,
    RsaSignSha512,
    EcdsaSignMd5Sha1,
    EcdsaSignSha1,
    EcdsaSignSha224,
    EcdsaSignSha256,
    EcdsaSignSha384,
    EcdsaSignSha512,
    Ed25519Sign,
    RsaPssSignSha256,
    RsaPssSignSha384,
    RsaPssSignSha512,
    Ping,
    /// Any opcode byte this build does not know about.
    Unknown(u8),
}

/// Isolation class used to route an opcode to a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolClass {
    /// Cheap, latency-sensitive requests (ping, rejected opcodes).
    Control,
    /// Elliptic-curve signatures.
    Ecdsa,
    /// RSA signatures and decryption.
    Rsa,
}

impl Op {
    pub fn to_byte(self) -> u8 {
        match self {
            Op::RsaDecrypt => 0x01,
            Op::RsaSignMd5Sha1 => 0x02,
            Op::RsaSignSha1 => 0x03,
            Op::RsaSignSha224 => 0x04,
            Op::RsaSignSha256 => 0x05,
            Op::RsaSignSha384 => 0x06,
            Op::RsaSignSha512 => 0x07,
            Op::EcdsaSignMd5Sha1 => 0x12,
            Op::EcdsaSignSha1 => 0x13,
            Op::EcdsaSignSha224 => 0x14,
            Op::EcdsaSignSha256 => 0x15,
            Op::EcdsaSignSha384 => 0x16,
            Op::EcdsaSignSha512 => 0x17,
            Op::Ed25519Sign => 0x18,
            Op::RsaPssSignSha256 => 0x35,
            Op::RsaPssSignSha384 => 0x36,
            Op::RsaPssSignSha512 => 0x37,
            Op::Ping => 0xF1,
            Op::Unknown(b) => b,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => Op::RsaDecrypt,
            0x02 => Op::RsaSignMd5Sha1,
            0x03 => Op::RsaSignSha1,
            0x04 => Op::RsaSignSha224,
            0x05 => Op::RsaSignSha256,
            0x06 => Op::RsaSignSha384,
            0x07 => Op::RsaSignSha512,
            0x12 => Op::EcdsaSignMd5Sha1,
            0x13 => Op::EcdsaSignSha1,
            0x14 => Op::EcdsaSignSha224,
            0x15 => Op::EcdsaSignSha256,
            0x16 => Op::EcdsaSignSha384,
            0x17 => Op::EcdsaSignSha512,
            0x18 => Op::Ed25519Sign,
            0x35 => Op::RsaPssSignSha256,
            0x36 => Op::RsaPssSignSha384,
            0x37 => Op::RsaPssSignSha512,
            0xF1 => Op::Ping,
            other => Op::Unknown(other),
        }
    }

    /// True for opcodes that produce a signature with a stored key.
    pub fn is_sign(self) -> bool {
        !matches!(self, Op::RsaDecrypt | Op::Ping | Op::Unknown(_))
    }

    pub fn class(self) -> PoolClass {
        match self {
            Op::Ping | Op::Unknown(_) => PoolClass::Control,
            Op::EcdsaSignMd5Sha1
            | Op::EcdsaSignSha1
            | Op::EcdsaSignSha224
            | Op::EcdsaSignSha256
            | Op::EcdsaSignSha384
            | Op::EcdsaSignSha512
            | Op::Ed25519Sign => PoolClass::Ecdsa,
            _ => PoolClass::Rsa,
        }
    }

    /// Stable label used for logs and metrics.
    pub fn name(self) -> &'static str {
        match self {
            Op::RsaDecrypt => "rsa_decrypt",
            Op::RsaSignMd5Sha1 => "rsa_sign_md5sha1",
            Op::RsaSignSha1 => "rsa_sign_sha1",
            Op::RsaSignSha224 => "rsa_sign_sha224",
            Op::RsaSignSha256 => "rsa_sign_sha256",
            Op::RsaSignSha384 => "rsa_sign_sha384",
            Op::RsaSignSha512 => "rsa_sign_sha512",
            Op::EcdsaSignMd5Sha1 => "ecdsa_sign_md5sha1",
            Op::EcdsaSignSha1 => "ecdsa_sign_sha1",
            Op::EcdsaSignSha224 => "ecdsa_sign_sha224",
            Op::EcdsaSignSha256 => "ecdsa_sign_sha256",
            Op::EcdsaSignSha384 => "ecdsa_sign_sha384",
            Op::EcdsaSignSha512 => "ecdsa_sign_sha512",
            Op::Ed25519Sign => "ed25519_sign",
            Op::RsaPssSignSha256 => "rsa_pss_sign_sha256",
            Op::RsaPssSignSha384 => "rsa_pss_sign_sha384",
            Op::RsaPssSignSha512 => "rsa_pss_sign_sha512",
            Op::Ping => "ping",
            Op::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Unknown(b) => write!(f, "unknown(0x{:02x})", b),
            op => f.write_str(op.name()),
        }
    }
}

impl fmt::Display for PoolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolClass::Control => "control",
            PoolClass::Ecdsa => "ecdsa",
            PoolClass::Rsa => "rsa",
        };
        f.write_str(name)
    }
}

/// Failure reported back to the client inside a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorCode {
    #[error("cryptographic operation failed")]
    CryptoFailed,
    #[error("key not found")]
    KeyNotFound,
    #[error("read error")]
    Read,
    #[error("protocol version mismatch")]
    VersionMismatch,
    #[error("bad opcode")]
    BadOpcode,
    #[error("unexpected opcode")]
    UnexpectedOpcode,
    #[error("malformed request")]
    Format,
    #[error("internal error")]
    Internal,
    #[error("unknown error code {0}")]
    Other(u8),
}

impl ErrorCode {
    pub fn to_byte(self) -> u8 {
        match self {
            ErrorCode::CryptoFailed => 0x01,
            ErrorCode::KeyNotFound => 0x02,
            ErrorCode::Read => 0x03,
            ErrorCode::VersionMismatch => 0x04,
            ErrorCode::BadOpcode => 0x05,
            ErrorCode::UnexpectedOpcode => 0x06,
            ErrorCode::Format => 0x07,
            ErrorCode::Internal => 0x08,
            ErrorCode::Other(b) => b,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => ErrorCode::CryptoFailed,
            0x02 => ErrorCode::KeyNotFound,
            0x03 => ErrorCode::Read,
            0x04 => ErrorCode::VersionMismatch,
            0x05 => ErrorCode::BadOpcode,
            0x06 => ErrorCode::UnexpectedOpcode,
            0x07 => ErrorCode::Format,
            0x08 => ErrorCode::Internal,
            other => ErrorCode::Other(other),
        }
    }

    /// Label used for the `status` metric dimension.
    pub fn label(self) -> &'static str {
        match self {
            ErrorCode::CryptoFailed => "crypto_failed",
            ErrorCode::KeyNotFound => "key_not_found",
            ErrorCode::Read => "read",
            ErrorCode::VersionMismatch => "version_mismatch",
            ErrorCode::BadOpcode => "bad_opcode",
            ErrorCode::UnexpectedOpcode => "unexpected_opcode",
            ErrorCode::Format => "format",
            ErrorCode::Internal => "internal",
            ErrorCode::Other(_) => "other",
        }
    }
}
