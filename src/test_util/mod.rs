//! Utilities for testing code built on sessions: a scripted in-memory transport and helpers for
//!  building frames. They are used by this crate's own tests, but they are part of the regular
//!  (non-#[cfg(test)]) code so that applications can test their command tables with them.

pub mod transport;

use bytes::Bytes;

use crate::protocol::frame::{DsiCommand, Frame, FrameFlags};

/// a command request frame whose payload starts with `opcode`
pub fn command_frame(request_id: u16, opcode: u8, args: &[u8]) -> Frame {
    let mut payload = Vec::with_capacity(args.len() + 1);
    payload.push(opcode);
    payload.extend_from_slice(args);
    Frame::request(DsiCommand::Command, request_id, Bytes::from(payload))
}

pub fn command_frame_no_reply(request_id: u16, opcode: u8) -> Frame {
    let mut frame = command_frame(request_id, opcode, &[]);
    frame.flags |= FrameFlags::NO_REPLY;
    frame
}

pub fn command_reply(request_id: u16, result_code: u32, payload: &'static [u8]) -> Frame {
    Frame::reply_to(DsiCommand::Command.into(), request_id, result_code, Bytes::from_static(payload))
}

pub fn attention_ack(request_id: u16) -> Frame {
    Frame::reply_to(DsiCommand::Attention.into(), request_id, 0, Bytes::new())
}

