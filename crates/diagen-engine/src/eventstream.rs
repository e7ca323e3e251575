//! Reader and writer for `application/vnd.amazon.eventstream` frames.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! total_len:u32 | headers_len:u32 | prelude_crc:u32 | headers | payload | message_crc:u32
//! ```

use std::io::{ErrorKind, Read};

use anyhow::{bail, Context, Result};
use crc32fast::Hasher as Crc32;

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;
const MIN_FRAME_LEN: usize = PRELUDE_LEN + CRC_LEN;
const MAX_FRAME_LEN: usize = 24 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bytes(Vec<u8>),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: HeaderValue,
}

impl Header {
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: HeaderValue::String(value.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub headers: Vec<Header>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|header| match &header.value {
            HeaderValue::String(value) if header.name == name => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header_str(":message-type")
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header_str(":event-type")
    }

    pub fn is_exception(&self) -> bool {
        matches!(self.message_type(), Some("exception") | Some("error"))
    }
}

/// Pulls whole frames off a byte stream, one at a time.
pub struct MessageReader<R> {
    inner: R,
}

impl<R: Read> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Returns `Ok(None)` on a clean end of stream between frames.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let mut prelude = [0u8; PRELUDE_LEN];
        if !read_full_or_eof(&mut self.inner, &mut prelude)? {
            return Ok(None);
        }
        let total_len = be_u32(&prelude[0..4]) as usize;
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_len) {
            bail!("event stream frame has invalid length {total_len}");
        }
        let mut frame = vec![0u8; total_len];
        frame[..PRELUDE_LEN].copy_from_slice(&prelude);
        self.inner
            .read_exact(&mut frame[PRELUDE_LEN..])
            .context("event stream ended inside a frame")?;
        decode_message(&frame).map(Some)
    }
}

impl<R: Read> Iterator for MessageReader<R> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_message().transpose()
    }
}

pub fn decode_message(frame: &[u8]) -> Result<Message> {
    if frame.len() < MIN_FRAME_LEN {
        bail!("event stream frame too short ({} bytes)", frame.len());
    }
    let total_len = be_u32(&frame[0..4]) as usize;
    let headers_len = be_u32(&frame[4..8]) as usize;
    if total_len != frame.len() {
        bail!(
            "event stream frame length mismatch: header says {total_len}, got {}",
            frame.len()
        );
    }
    if headers_len > total_len - MIN_FRAME_LEN {
        bail!("event stream headers overflow the frame ({headers_len} bytes)");
    }

    let prelude_crc = be_u32(&frame[8..12]);
    if crc32(&frame[..8]) != prelude_crc {
        bail!("event stream prelude checksum mismatch");
    }
    let message_crc = be_u32(&frame[total_len - CRC_LEN..]);
    if crc32(&frame[..total_len - CRC_LEN]) != message_crc {
        bail!("event stream message checksum mismatch");
    }

    let headers_end = PRELUDE_LEN + headers_len;
    let headers = decode_headers(&frame[PRELUDE_LEN..headers_end])?;
    let payload = frame[headers_end..total_len - CRC_LEN].to_vec();
    Ok(Message { headers, payload })
}

pub fn encode_message(headers: &[Header], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for header in headers {
        encode_header(header, &mut header_bytes);
    }
    let total_len = PRELUDE_LEN + header_bytes.len() + payload.len() + CRC_LEN;

    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&(total_len as u32).to_be_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    let prelude_crc = crc32(&frame);
    frame.extend_from_slice(&prelude_crc.to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    let message_crc = crc32(&frame);
    frame.extend_from_slice(&message_crc.to_be_bytes());
    frame
}

fn decode_headers(mut bytes: &[u8]) -> Result<Vec<Header>> {
    let mut headers = Vec::new();
    while !bytes.is_empty() {
        let name_len = take(&mut bytes, 1)?[0] as usize;
        let name = String::from_utf8(take(&mut bytes, name_len)?.to_vec())
            .context("event stream header name is not UTF-8")?;
        let kind = take(&mut bytes, 1)?[0];
        let value = match kind {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => HeaderValue::Byte(take(&mut bytes, 1)?[0] as i8),
            3 => HeaderValue::Short(i16::from_be_bytes(fixed(take(&mut bytes, 2)?))),
            4 => HeaderValue::Int(i32::from_be_bytes(fixed(take(&mut bytes, 4)?))),
            5 => HeaderValue::Long(i64::from_be_bytes(fixed(take(&mut bytes, 8)?))),
            6 => {
                let len = u16::from_be_bytes(fixed(take(&mut bytes, 2)?)) as usize;
                HeaderValue::Bytes(take(&mut bytes, len)?.to_vec())
            }
            7 => {
                let len = u16::from_be_bytes(fixed(take(&mut bytes, 2)?)) as usize;
                let raw = take(&mut bytes, len)?.to_vec();
                HeaderValue::String(
                    String::from_utf8(raw)
                        .with_context(|| format!("header {name} is not UTF-8"))?,
                )
            }
            8 => HeaderValue::Timestamp(i64::from_be_bytes(fixed(take(&mut bytes, 8)?))),
            9 => HeaderValue::Uuid(fixed(take(&mut bytes, 16)?)),
            other => bail!("event stream header {name} has unknown type {other}"),
        };
        headers.push(Header { name, value });
    }
    Ok(headers)
}

fn encode_header(header: &Header, out: &mut Vec<u8>) {
    let name = header.name.as_bytes();
    out.push(name.len().min(u8::MAX as usize) as u8);
    out.extend_from_slice(&name[..name.len().min(u8::MAX as usize)]);
    match &header.value {
        HeaderValue::Bool(true) => out.push(0),
        HeaderValue::Bool(false) => out.push(1),
        HeaderValue::Byte(value) => {
            out.push(2);
            out.push(*value as u8);
        }
        HeaderValue::Short(value) => {
            out.push(3);
            out.extend_from_slice(&value.to_be_bytes());
        }
        HeaderValue::Int(value) => {
            out.push(4);
            out.extend_from_slice(&value.to_be_bytes());
        }
        HeaderValue::Long(value) => {
            out.push(5);
            out.extend_from_slice(&value.to_be_bytes());
        }
        HeaderValue::Bytes(value) => {
            out.push(6);
            push_sized(out, value);
        }
        HeaderValue::String(value) => {
            out.push(7);
            push_sized(out, value.as_bytes());
        }
        HeaderValue::Timestamp(value) => {
            out.push(8);
            out.extend_from_slice(&value.to_be_bytes());
        }
        HeaderValue::Uuid(value) => {
            out.push(9);
            out.extend_from_slice(value);
        }
    }
}

fn push_sized(out: &mut Vec<u8>, value: &[u8]) {
    let len = value.len().min(u16::MAX as usize);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&value[..len]);
}

fn take<'a>(bytes: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if bytes.len() < len {
        bail!("event stream header truncated");
    }
    let (head, tail) = bytes.split_at(len);
    *bytes = tail;
    Ok(head)
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(fixed(bytes))
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn read_full_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => bail!("event stream ended inside a frame prelude"),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("event stream read failed"),
        }
    }
    Ok(true)
}
