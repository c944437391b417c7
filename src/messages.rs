use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use core::fmt;
use std::io::{Read, Write};

/// Plain message header - flags, session id, 32-bit message counter and
/// optional 64-bit source/destination node ids. Little endian on the wire.
#[derive(Debug)]
pub struct MessageHeader {
    pub flags: u8,
    pub security_flags: u8,
    pub session_id: u16,
    pub message_counter: u32,
    pub source_node_id: Option<u64>,
    pub destination_node_id: Option<u64>,
}

impl MessageHeader {
    const FLAG_SRC_PRESENT: u8 = 4;
    const DSIZ_64: u8 = 1;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags = 0;
        if self.source_node_id.is_some() {
            flags |= Self::FLAG_SRC_PRESENT;
        }
        if self.destination_node_id.is_some() {
            flags |= Self::DSIZ_64;
        }
        let mut out = Vec::with_capacity(64);
        out.write_u8(flags)?;
        out.write_u16::<LittleEndian>(self.session_id)?;
        out.write_u8(self.security_flags)?;
        out.write_u32::<LittleEndian>(self.message_counter)?;
        if let Some(src) = self.source_node_id {
            out.write_u64::<LittleEndian>(src)?;
        }
        if let Some(dst) = self.destination_node_id {
            out.write_u64::<LittleEndian>(dst)?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let flags = cursor.read_u8()?;
        let session_id = cursor.read_u16::<LittleEndian>()?;
        let security_flags = cursor.read_u8()?;
        let message_counter = cursor.read_u32::<LittleEndian>()?;
        let source_node_id = if (flags & Self::FLAG_SRC_PRESENT) != 0 {
            Some(cursor.read_u64::<LittleEndian>()?)
        } else {
            None
        };
        let destination_node_id = if (flags & Self::DSIZ_64) != 0 {
            Some(cursor.read_u64::<LittleEndian>()?)
        } else {
            None
        };
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                flags,
                security_flags,
                session_id,
                message_counter,
                source_node_id,
                destination_node_id,
            },
            rest,
        ))
    }
}

#[derive(Debug)]
pub struct ProtocolMessageHeader {
    pub exchange_flags: u8,
    pub opcode: u8,
    pub exchange_id: u16,
    pub protocol_id: u16,
    pub ack_counter: u32,
}

impl ProtocolMessageHeader {
    pub const FLAG_INITIATOR: u8 = 1;
    pub const FLAG_ACK: u8 = 2;
    pub const FLAG_RELIABILITY: u8 = 4;

    pub const OPCODE_MSG_COUNTER_SYNC_REQ: u8 = 0x00;
    pub const OPCODE_MSG_COUNTER_SYNC_RSP: u8 = 0x01;
    pub const OPCODE_ACK: u8 = 0x10;
    pub const OPCODE_STATUS: u8 = 0x40;

    pub const PROTOCOL_ID_SECURE_CHANNEL: u16 = 0;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        out.write_u8(self.exchange_flags)?;
        out.write_u8(self.opcode)?;
        out.write_u16::<LittleEndian>(self.exchange_id)?;
        out.write_u16::<LittleEndian>(self.protocol_id)?;
        if (self.exchange_flags & Self::FLAG_ACK) != 0 {
            out.write_u32::<LittleEndian>(self.ack_counter)?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let exchange_flags = cursor.read_u8()?;
        let opcode = cursor.read_u8()?;
        let exchange_id = cursor.read_u16::<LittleEndian>()?;
        let protocol_id = cursor.read_u16::<LittleEndian>()?;
        let mut ack_counter = 0;
        if (exchange_flags & Self::FLAG_ACK) != 0 {
            ack_counter = cursor.read_u32::<LittleEndian>()?;
        }
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                exchange_flags,
                opcode,
                exchange_id,
                protocol_id,
                ack_counter,
            },
            rest,
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SecureChannelGeneralCode {
    Success = 0,
    Failure = 1,
    BadPrecondition = 2,
    Unexpected = 6,
    ResourceExhausted = 7,
    Busy = 8,
    Timeout = 9,
    NotFound = 13,
    Unknown = 0xffff,
}

impl From<u16> for SecureChannelGeneralCode {
    fn from(value: u16) -> Self {
        match value {
            0 => SecureChannelGeneralCode::Success,
            1 => SecureChannelGeneralCode::Failure,
            2 => SecureChannelGeneralCode::BadPrecondition,
            6 => SecureChannelGeneralCode::Unexpected,
            7 => SecureChannelGeneralCode::ResourceExhausted,
            8 => SecureChannelGeneralCode::Busy,
            9 => SecureChannelGeneralCode::Timeout,
            13 => SecureChannelGeneralCode::NotFound,
            _ => SecureChannelGeneralCode::Unknown,
        }
    }
}

impl std::fmt::Display for SecureChannelGeneralCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecureChannelGeneralCode::Success => write!(f, "SUCCESS"),
            SecureChannelGeneralCode::Failure => write!(f, "FAILURE"),
            SecureChannelGeneralCode::BadPrecondition => write!(f, "BAD_PRECONDITION"),
            SecureChannelGeneralCode::Unexpected => write!(f, "UNEXPECTED"),
            SecureChannelGeneralCode::ResourceExhausted => write!(f, "RESOURCE_EXHAUSTED"),
            SecureChannelGeneralCode::Busy => write!(f, "BUSY"),
            SecureChannelGeneralCode::Timeout => write!(f, "TIMEOUT"),
            SecureChannelGeneralCode::NotFound => write!(f, "NOT_FOUND"),
            SecureChannelGeneralCode::Unknown => write!(f, "UNKNOWN {}", *self as u16),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatusReportInfo {
    pub general_code: u16,
    pub protocol_id: u32,
    pub protocol_code: u16,
}

impl std::fmt::Display for StatusReportInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.general_code == 0 {
            return write!(f, "StatusReportInfo: OK");
        }
        let gc = Into::<SecureChannelGeneralCode>::into(self.general_code);
        write!(
            f,
            "StatusReportInfo: general_code={}, protocol_id={}, protocol_code={}",
            gc, self.protocol_id, self.protocol_code
        )
    }
}

impl StatusReportInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let general_code = cursor.read_u16::<LittleEndian>()?;
        let protocol_id = cursor.read_u32::<LittleEndian>()?;
        let protocol_code = cursor.read_u16::<LittleEndian>()?;
        Ok(Self {
            general_code,
            protocol_id,
            protocol_code,
        })
    }
    pub fn is_ok(&self) -> bool {
        self.general_code == 0 && self.protocol_id == 0 && self.protocol_code == 0
    }
}

/// Decoded message - both headers plus the raw protocol payload of a
/// frame after session decryption.
pub struct Message {
    pub message_header: MessageHeader,
    pub protocol_header: ProtocolMessageHeader,
    pub payload: Vec<u8>,
    pub status_report_info: Option<StatusReportInfo>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("message_header", &self.message_header)
            .field("protocol_header", &self.protocol_header)
            .field("payload", &hex::encode(&self.payload))
            .field("status_report_info", &self.status_report_info)
            .finish()
    }
}

impl Message {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (message_header, rest) = MessageHeader::decode(data)?;
        let (protocol_header, rest) = ProtocolMessageHeader::decode(&rest)?;
        let status_report_info = if protocol_header.protocol_id
            == ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL
            && protocol_header.opcode == ProtocolMessageHeader::OPCODE_STATUS
        {
            Some(StatusReportInfo::parse(&rest)?)
        } else {
            None
        };
        Ok(Self {
            message_header,
            protocol_header,
            payload: rest,
            status_report_info,
        })
    }

    pub fn is_standalone_ack(&self) -> bool {
        self.protocol_header.protocol_id == ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL
            && self.protocol_header.opcode == ProtocolMessageHeader::OPCODE_ACK
    }

    pub fn has_ack(&self) -> bool {
        (self.protocol_header.exchange_flags & ProtocolMessageHeader::FLAG_ACK) != 0
    }

    pub fn wants_ack(&self) -> bool {
        (self.protocol_header.exchange_flags & ProtocolMessageHeader::FLAG_RELIABILITY) != 0
    }
}

/// Standalone acknowledgement - zero-length application payload, ACK
/// flag set, reliability flag deliberately clear (an ack must never
/// itself demand an ack).
pub fn ack(exchange: u16, ack_counter: u32) -> Result<Vec<u8>> {
    ProtocolMessageHeader {
        exchange_flags: ProtocolMessageHeader::FLAG_INITIATOR | ProtocolMessageHeader::FLAG_ACK,
        opcode: ProtocolMessageHeader::OPCODE_ACK,
        exchange_id: exchange,
        protocol_id: ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL,
        ack_counter,
    }
    .encode()
}

pub const SYNC_CHALLENGE_SIZE: usize = 16;

/// Message counter synchronization request carrying a random challenge.
pub fn msg_counter_sync_req(
    exchange: u16,
    challenge: &[u8; SYNC_CHALLENGE_SIZE],
) -> Result<Vec<u8>> {
    let mut b = ProtocolMessageHeader {
        exchange_flags: ProtocolMessageHeader::FLAG_INITIATOR,
        opcode: ProtocolMessageHeader::OPCODE_MSG_COUNTER_SYNC_REQ,
        exchange_id: exchange,
        protocol_id: ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL,
        ack_counter: 0,
    }
    .encode()?;
    b.write_all(challenge)?;
    Ok(b)
}

/// Message counter synchronization response - echoed challenge followed
/// by the responder's current counter (payload size = challenge size + 4).
pub fn msg_counter_sync_rsp(
    exchange: u16,
    challenge: &[u8; SYNC_CHALLENGE_SIZE],
    counter: u32,
) -> Result<Vec<u8>> {
    let mut b = ProtocolMessageHeader {
        exchange_flags: 0,
        opcode: ProtocolMessageHeader::OPCODE_MSG_COUNTER_SYNC_RSP,
        exchange_id: exchange,
        protocol_id: ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL,
        ack_counter: 0,
    }
    .encode()?;
    b.write_all(challenge)?;
    b.write_u32::<LittleEndian>(counter)?;
    Ok(b)
}

pub fn parse_sync_req(payload: &[u8]) -> Result<[u8; SYNC_CHALLENGE_SIZE]> {
    if payload.len() < SYNC_CHALLENGE_SIZE {
        anyhow::bail!("sync request too short: {} bytes", payload.len());
    }
    let mut challenge = [0u8; SYNC_CHALLENGE_SIZE];
    challenge.copy_from_slice(&payload[..SYNC_CHALLENGE_SIZE]);
    Ok(challenge)
}

pub fn parse_sync_rsp(payload: &[u8]) -> Result<([u8; SYNC_CHALLENGE_SIZE], u32)> {
    if payload.len() < SYNC_CHALLENGE_SIZE + 4 {
        anyhow::bail!("sync response too short: {} bytes", payload.len());
    }
    let mut challenge = [0u8; SYNC_CHALLENGE_SIZE];
    challenge.copy_from_slice(&payload[..SYNC_CHALLENGE_SIZE]);
    let mut cursor = std::io::Cursor::new(&payload[SYNC_CHALLENGE_SIZE..]);
    let counter = cursor.read_u32::<LittleEndian>()?;
    Ok((challenge, counter))
}

/// StatusReport on the secure channel, used to signal protocol failures
/// to the peer.
pub fn status_report(exchange: u16, general_code: u16, protocol_code: u16) -> Result<Vec<u8>> {
    let mut b = ProtocolMessageHeader {
        exchange_flags: 0,
        opcode: ProtocolMessageHeader::OPCODE_STATUS,
        exchange_id: exchange,
        protocol_id: ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL,
        ack_counter: 0,
    }
    .encode()?;
    b.write_u16::<LittleEndian>(general_code)?;
    b.write_u32::<LittleEndian>(ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL as u32)?;
    b.write_u16::<LittleEndian>(protocol_code)?;
    Ok(b)
}
