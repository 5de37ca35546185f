//! Binary frame envelope: `typeByte | agentNameUtf8 | 0x00 | payload`.

use anyhow::{bail, Context, Result};

/// Server → client: terminal output (JSON snapshot or diff payload).
pub const FRAME_OUTPUT: u8 = 0x01;
/// Client → server: raw keystrokes for the agent's pane.
pub const FRAME_KEYSTROKES: u8 = 0x02;
/// Client → server: resize request, payload `"cols:rows"`.
pub const FRAME_RESIZE: u8 = 0x03;
/// Client → server: file upload envelope.
pub const FRAME_FILE_UPLOAD: u8 = 0x04;

#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub frame_type: u8,
    pub agent: &'a str,
    pub payload: &'a [u8],
}

pub fn encode_frame(frame_type: u8, agent: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + agent.len() + 1 + payload.len());
    out.push(frame_type);
    out.extend_from_slice(agent.as_bytes());
    out.push(0);
    out.extend_from_slice(payload);
    out
}

pub fn decode_frame(data: &[u8]) -> Result<Frame<'_>> {
    if data.is_empty() {
        bail!("empty binary frame");
    }
    let frame_type = data[0];
    let rest = &data[1..];
    let terminator = rest
        .iter()
        .position(|&b| b == 0)
        .context("binary frame missing agent name terminator")?;
    let agent = std::str::from_utf8(&rest[..terminator]).context("agent name is not UTF-8")?;
    Ok(Frame {
        frame_type,
        agent,
        payload: &rest[terminator + 1..],
    })
}
