use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::safe_converter::PrecheckedCast;

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct FrameFlags: u8 {
        /// set for replies, clear for requests
        const REPLY    = 0b0000_0001;
        /// a command request that does not want a reply - the result is still cached
        const NO_REPLY = 0b0000_0010;
    }
}

/// The command tag in a frame's header. AFP commands travel inside `Command` and `Write` frames,
///  their opcode being the first payload byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DsiCommand {
    CloseSession = 1,
    Command = 2,
    GetStatus = 3,
    OpenSession = 4,
    Tickle = 5,
    Write = 6,
    Attention = 8,
}

/// One unit of data on the wire.
///
/// Header layout (all numbers in network byte order):
/// ```ascii
/// 0:  flags (u8)
/// 1:  command (u8)
/// 2:  request id (u16)
/// 4:  code (u32) - result code in replies, data offset in requests
/// 8:  payload length (u32)
/// 12: reserved (u32), always 0
/// 16: payload
/// ```
///
/// The command is kept as a raw byte so that a frame with an unknown command can still be
///  answered with an error reply for its request id.
#[derive(Clone, Eq, PartialEq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub command: u8,
    pub request_id: u16,
    pub code: u32,
    pub payload: Bytes,
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let command = DsiCommand::try_from(self.command)
            .map(|c| format!("{:?}", c))
            .unwrap_or_else(|_| format!("0x{:02X}", self.command));
        let direction = if self.flags.contains(FrameFlags::REPLY) { "REPLY" } else { "REQ" };

        write!(f, "FRAME{{{}:{}#{} code={} len={}}}", direction, command, self.request_id, self.code, self.payload.len())
    }
}

impl Frame {
    pub const HEADER_LEN: usize = 16;

    pub fn request(command: DsiCommand, request_id: u16, payload: Bytes) -> Frame {
        Frame {
            flags: FrameFlags::empty(),
            command: command.into(),
            request_id,
            code: 0,
            payload,
        }
    }

    /// a reply to a request frame, echoing its command and request id
    pub fn reply_to(command: u8, request_id: u16, result_code: u32, payload: Bytes) -> Frame {
        Frame {
            flags: FrameFlags::REPLY,
            command,
            request_id,
            code: result_code,
            payload,
        }
    }

    pub fn tickle(request_id: u16) -> Frame {
        Self::request(DsiCommand::Tickle, request_id, Bytes::new())
    }

    pub fn attention(request_id: u16, attention_code: u16) -> Frame {
        Self::request(DsiCommand::Attention, request_id, Bytes::copy_from_slice(&attention_code.to_be_bytes()))
    }

    pub fn close_session(request_id: u16) -> Frame {
        Self::request(DsiCommand::CloseSession, request_id, Bytes::new())
    }

    pub fn is_reply(&self) -> bool {
        self.flags.contains(FrameFlags::REPLY)
    }

    /// NB: The header's length field is 32 bits wide, and this panics for a longer payload.
    ///  Callers must bound the payload, as [crate::protocol::transport::StreamTransport] does with
    ///  its `max_payload_len`.
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.reserve(Self::HEADER_LEN + self.payload.len());
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.command);
        buf.put_u16(self.request_id);
        buf.put_u32(self.code);
        buf.put_u32(self.payload.len().prechecked_cast());
        buf.put_u32(0);
        buf.put_slice(&self.payload);
    }

    /// Splits the next complete frame off the front of `buf`. Returns `Ok(None)` if `buf` does not
    ///  yet hold a complete frame, leaving it untouched.
    ///
    /// An error means the stream is corrupt and cannot be resynchronized.
    pub fn try_deser(buf: &mut BytesMut, max_payload_len: usize) -> anyhow::Result<Option<Frame>> {
        if buf.len() < Self::HEADER_LEN {
            return Ok(None);
        }

        let mut header = &buf[..Self::HEADER_LEN];
        let flags = header.get_u8();
        let command = header.get_u8();
        let request_id = header.get_u16();
        let code = header.get_u32();
        let payload_len = header.get_u32() as usize;

        let Some(flags) = FrameFlags::from_bits(flags) else {
            bail!("invalid frame flags 0x{:02X}", flags);
        };
        if payload_len > max_payload_len {
            bail!("frame payload of {} bytes exceeds the maximum of {} bytes", payload_len, max_payload_len);
        }
        if buf.len() < Self::HEADER_LEN + payload_len {
            return Ok(None);
        }

        buf.advance(Self::HEADER_LEN);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Frame {
            flags,
            command,
            request_id,
            code,
            payload,
        }))
    }
}

/// The dispatcher's view of an incoming frame
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameKind {
    /// the peer's tickle, or its reply to one of ours
    HeartbeatAck,
    CloseRequest,
    Command,
    CommandNoReply,
    /// the peer's acknowledgement of an attention we sent
    AttentionAck,
}

impl FrameKind {
    pub fn classify(frame: &Frame) -> anyhow::Result<FrameKind> {
        let command = match DsiCommand::try_from(frame.command) {
            Ok(command) => command,
            Err(_) => bail!("unknown command 0x{:02X}", frame.command),
        };

        if frame.is_reply() {
            return match command {
                DsiCommand::Tickle => Ok(FrameKind::HeartbeatAck),
                DsiCommand::Attention => Ok(FrameKind::AttentionAck),
                other => bail!("unexpected reply for {:?}", other),
            };
        }

        match command {
            DsiCommand::Tickle => Ok(FrameKind::HeartbeatAck),
            DsiCommand::CloseSession => Ok(FrameKind::CloseRequest),
            DsiCommand::Command | DsiCommand::Write => {
                if frame.flags.contains(FrameFlags::NO_REPLY) {
                    Ok(FrameKind::CommandNoReply)
                }
                else {
                    Ok(FrameKind::Command)
                }
            }
            DsiCommand::GetStatus | DsiCommand::OpenSession | DsiCommand::Attention => {
                bail!("{:?} is not valid inside an established session", command)
            }
        }
    }
}
