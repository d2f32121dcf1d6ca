use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// TFTP opcodes per RFC 1350 + RFC 2347.
const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;
const OPCODE_OACK: u16 = 6;

/// Default data payload per DATA packet (RFC 1350).
pub const BLOCK_SIZE: usize = 512;

/// Smallest negotiable blksize (RFC 2348).
pub const MIN_BLKSIZE: usize = 8;

/// Largest negotiable blksize (RFC 2348).
pub const MAX_BLKSIZE: usize = 65464;

/// Largest datagram a session ever sends or receives (4-byte header + max
/// blksize).
pub const MAX_PACKET: usize = 4 + MAX_BLKSIZE;

/// Why a datagram could not be decoded into a [`Packet`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("packet too short")]
    Truncated,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("malformed request")]
    InvalidRequest,
    #[error("unsupported transfer mode \"{0}\"")]
    UnsupportedMode(String),
    #[error("string field is not valid UTF-8")]
    InvalidString,
    #[error("DATA packet with block number 0")]
    ZeroDataBlock,
    #[error("ACK packet must be exactly 4 bytes")]
    InvalidAck,
    #[error("error code {0} out of range")]
    InvalidErrorCode(u16),
    #[error("malformed or empty OACK option list")]
    InvalidOack,
}

/// TFTP transfer mode. `mail` (RFC 1350) is obsolete and rejected at parse
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Netascii,
    Octet,
}

impl FromStr for Mode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(Mode::Netascii),
            "octet" => Ok(Mode::Octet),
            other => Err(ParseError::UnsupportedMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Netascii => write!(f, "netascii"),
            Mode::Octet => write!(f, "octet"),
        }
    }
}

/// TFTP error codes, RFC 1350 + RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
    InvalidOptions = 8,
}

impl TryFrom<u16> for ErrorCode {
    type Error = ParseError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ErrorCode::Undefined),
            1 => Ok(ErrorCode::FileNotFound),
            2 => Ok(ErrorCode::AccessViolation),
            3 => Ok(ErrorCode::DiskFull),
            4 => Ok(ErrorCode::IllegalOperation),
            5 => Ok(ErrorCode::UnknownTransferId),
            6 => Ok(ErrorCode::FileExists),
            7 => Ok(ErrorCode::NoSuchUser),
            8 => Ok(ErrorCode::InvalidOptions),
            other => Err(ParseError::InvalidErrorCode(other)),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            ErrorCode::Undefined => "not defined",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFull => "disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "illegal TFTP operation",
            ErrorCode::UnknownTransferId => "unknown transfer ID",
            ErrorCode::FileExists => "file already exists",
            ErrorCode::NoSuchUser => "no such user",
            ErrorCode::InvalidOptions => "invalid options",
        };
        write!(f, "{desc}")
    }
}

/// A fully parsed TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Packet {
    RRQ {
        filename: String,
        mode: Mode,
        options: HashMap<String, String>,
    },
    WRQ {
        filename: String,
        mode: Mode,
        options: HashMap<String, String>,
    },
    DATA {
        block_num: u16,
        data: Vec<u8>,
    },
    ACK {
        block_num: u16,
    },
    ERROR {
        code: ErrorCode,
        msg: String,
    },
    /// Option Acknowledgment (RFC 2347).
    OACK {
        options: HashMap<String, String>,
    },
}

impl Packet {
    /// Parse raw bytes into a `Packet`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 2 {
            return Err(ParseError::Truncated);
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match opcode {
            OPCODE_RRQ => parse_request(buf, true),
            OPCODE_WRQ => parse_request(buf, false),
            OPCODE_DATA => parse_data(buf),
            OPCODE_ACK => parse_ack(buf),
            OPCODE_ERROR => parse_error(buf),
            OPCODE_OACK => parse_oack(buf),
            other => Err(ParseError::UnknownOpcode(other)),
        }
    }

    /// Serialize the packet to bytes for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::RRQ {
                filename,
                mode,
                options,
            } => encode_request(OPCODE_RRQ, filename, *mode, options),
            Packet::WRQ {
                filename,
                mode,
                options,
            } => encode_request(OPCODE_WRQ, filename, *mode, options),
            Packet::DATA { block_num, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&OPCODE_DATA.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Packet::ACK { block_num } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OPCODE_ACK.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf
            }
            Packet::ERROR { code, msg } => {
                let mut buf = Vec::with_capacity(5 + msg.len());
                buf.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
                buf.extend_from_slice(&u16::from(*code).to_be_bytes());
                buf.extend_from_slice(msg.as_bytes());
                buf.push(0);
                buf
            }
            Packet::OACK { options } => {
                let mut buf = Vec::new();
                buf.extend_from_slice(&OPCODE_OACK.to_be_bytes());
                for (key, val) in options {
                    buf.extend_from_slice(key.as_bytes());
                    buf.push(0);
                    buf.extend_from_slice(val.as_bytes());
                    buf.push(0);
                }
                buf
            }
        }
    }

    /// Build an ERROR packet from a code and message.
    pub fn error(code: ErrorCode, msg: impl Into<String>) -> Self {
        Packet::ERROR {
            code,
            msg: msg.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal parsing helpers
// ---------------------------------------------------------------------------

/// Split the post-opcode region on NUL, dropping empty tokens. Tolerates a
/// missing trailing NUL after the last field.
fn tokenize(payload: &[u8]) -> Vec<&[u8]> {
    payload.split(|&b| b == 0).filter(|t| !t.is_empty()).collect()
}

fn utf8_token(token: &[u8]) -> Result<String, ParseError> {
    String::from_utf8(token.to_vec()).map_err(|_| ParseError::InvalidString)
}

/// Parse RRQ / WRQ: 2-byte opcode | filename\0 | mode\0 [| option\0 | value\0 ]*
fn parse_request(buf: &[u8], is_rrq: bool) -> Result<Packet, ParseError> {
    let fields = tokenize(&buf[2..]);

    if fields.len() < 2 || fields.len() % 2 != 0 {
        return Err(ParseError::InvalidRequest);
    }

    let filename = utf8_token(fields[0])?;
    let mode: Mode = utf8_token(fields[1])?.parse()?;

    // RFC 2347 options: key-value pairs after the mode, keys lowercased.
    let mut options = HashMap::new();
    for pair in fields[2..].chunks_exact(2) {
        let key = utf8_token(pair[0])?.to_ascii_lowercase();
        let val = utf8_token(pair[1])?;
        options.insert(key, val);
    }

    if is_rrq {
        Ok(Packet::RRQ {
            filename,
            mode,
            options,
        })
    } else {
        Ok(Packet::WRQ {
            filename,
            mode,
            options,
        })
    }
}

/// Parse DATA: 2-byte opcode | 2-byte block# | 0..N bytes
fn parse_data(buf: &[u8]) -> Result<Packet, ParseError> {
    if buf.len() < 4 {
        return Err(ParseError::Truncated);
    }
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    if block_num == 0 {
        return Err(ParseError::ZeroDataBlock);
    }
    Ok(Packet::DATA {
        block_num,
        data: buf[4..].to_vec(),
    })
}

/// Parse ACK: 2-byte opcode | 2-byte block#, nothing else.
fn parse_ack(buf: &[u8]) -> Result<Packet, ParseError> {
    if buf.len() != 4 {
        return Err(ParseError::InvalidAck);
    }
    Ok(Packet::ACK {
        block_num: u16::from_be_bytes([buf[2], buf[3]]),
    })
}

/// Parse ERROR: 2-byte opcode | 2-byte code | msg\0
fn parse_error(buf: &[u8]) -> Result<Packet, ParseError> {
    if buf.len() < 4 {
        return Err(ParseError::Truncated);
    }
    let code = ErrorCode::try_from(u16::from_be_bytes([buf[2], buf[3]]))?;
    let msg_bytes = &buf[4..];
    let msg_bytes = msg_bytes.strip_suffix(&[0]).unwrap_or(msg_bytes);
    Ok(Packet::ERROR {
        code,
        msg: String::from_utf8_lossy(msg_bytes).into_owned(),
    })
}

/// Parse OACK: 2-byte opcode | [option\0 | value\0]+
fn parse_oack(buf: &[u8]) -> Result<Packet, ParseError> {
    let fields = tokenize(&buf[2..]);
    if fields.is_empty() || fields.len() % 2 != 0 {
        return Err(ParseError::InvalidOack);
    }
    let mut options = HashMap::new();
    for pair in fields.chunks_exact(2) {
        let key = utf8_token(pair[0])?.to_ascii_lowercase();
        let val = utf8_token(pair[1])?;
        options.insert(key, val);
    }
    Ok(Packet::OACK { options })
}

fn encode_request(
    opcode: u16,
    filename: &str,
    mode: Mode,
    options: &HashMap<String, String>,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + 8);
    buf.extend_from_slice(&opcode.to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.to_string().as_bytes());
    buf.push(0);
    for (key, val) in options {
        buf.extend_from_slice(key.as_bytes());
        buf.push(0);
        buf.extend_from_slice(val.as_bytes());
        buf.push(0);
    }
    buf
}
