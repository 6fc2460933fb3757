//! Length-prefixed request/response framing for decoder worker pipes.
//!
//! This is the only place bytes cross a process boundary. Every frame is
//! prefixed with a little-endian `u32` length so a blocking reader can never
//! be left mid-message by a partial read: it either gets a whole frame or an
//! I/O error.
//!
//! Wire layout:
//!
//! ```text
//! request  := len:u32  offset:u64  max_bytes:u32          (len == 12)
//! response := len:u32  status:u8  body
//!   status 0 (ok)   body := tile_count:u32 bytes_consumed:u32 pixels[..]
//!   status 1..=3    body := empty  (NotCompressed / Truncated / DecoderFault)
//! ```
//!
//! A request with `max_bytes == 0` is a health probe; workers answer it with
//! an ok frame of zero tiles. Timeout and Cancelled never cross the wire:
//! they are properties of the calling side, not of the worker.
//!
//! All integers are little-endian. Payloads are bounded by
//! [`MAX_RESPONSE_PAYLOAD`]; a frame claiming more is a protocol violation
//! and surfaces as `InvalidData` so the slot can recycle the worker.

use std::io::{self, Read, Write};

use crate::api::{DecodeError, TILE_PIXEL_BYTES};

/// Fixed size of a request frame body.
pub const REQUEST_BODY_LEN: u32 = 12;
/// Upper bound on decoded pixel payload per response (64 KiB of tiles).
pub const MAX_RESPONSE_PAYLOAD: usize = 1024 * 1024 * TILE_PIXEL_BYTES / 16;

const STATUS_OK: u8 = 0;
const STATUS_NOT_COMPRESSED: u8 = 1;
const STATUS_TRUNCATED: u8 = 2;
const STATUS_DECODER_FAULT: u8 = 3;

/// A successfully decoded response body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WirePayload {
    pub tile_count: u32,
    pub bytes_consumed: u32,
    pub pixels: Vec<u8>,
}

/// A whole response frame: decoded data or a worker-reported decode error.
pub type WireReply = Result<WirePayload, DecodeError>;

/// Writes one request frame and flushes.
pub fn write_request<W: Write>(w: &mut W, offset: u64, max_bytes: u32) -> io::Result<()> {
    let mut frame = [0u8; 4 + REQUEST_BODY_LEN as usize];
    frame[..4].copy_from_slice(&REQUEST_BODY_LEN.to_le_bytes());
    frame[4..12].copy_from_slice(&offset.to_le_bytes());
    frame[12..16].copy_from_slice(&max_bytes.to_le_bytes());
    w.write_all(&frame)?;
    w.flush()
}

/// Reads one request frame. Returns `None` on clean EOF before any byte,
/// which is the shutdown signal for worker processes.
pub fn read_request<R: Read>(r: &mut R) -> io::Result<Option<(u64, u32)>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len != REQUEST_BODY_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("request frame length {len}, expected {REQUEST_BODY_LEN}"),
        ));
    }
    let mut body = [0u8; REQUEST_BODY_LEN as usize];
    r.read_exact(&mut body)?;
    let offset = u64::from_le_bytes(body[..8].try_into().expect("fixed split"));
    let max_bytes = u32::from_le_bytes(body[8..].try_into().expect("fixed split"));
    Ok(Some((offset, max_bytes)))
}

/// Writes a successful response frame and flushes.
pub fn write_response_ok<W: Write>(
    w: &mut W,
    tile_count: u32,
    bytes_consumed: u32,
    pixels: &[u8],
) -> io::Result<()> {
    assert!(pixels.len() <= MAX_RESPONSE_PAYLOAD, "payload exceeds wire bound");
    let body_len = 1 + 4 + 4 + pixels.len();
    w.write_all(&(body_len as u32).to_le_bytes())?;
    w.write_all(&[STATUS_OK])?;
    w.write_all(&tile_count.to_le_bytes())?;
    w.write_all(&bytes_consumed.to_le_bytes())?;
    w.write_all(pixels)?;
    w.flush()
}

/// Writes an error response frame and flushes.
///
/// Only byte-shaped outcomes travel the wire; passing `Timeout` or
/// `Cancelled` here is a caller bug.
pub fn write_response_err<W: Write>(w: &mut W, error: DecodeError) -> io::Result<()> {
    let status = match error {
        DecodeError::NotCompressed => STATUS_NOT_COMPRESSED,
        DecodeError::Truncated => STATUS_TRUNCATED,
        DecodeError::DecoderFault => STATUS_DECODER_FAULT,
        DecodeError::Timeout | DecodeError::Cancelled => {
            panic!("{error:?} is not a wire status")
        }
    };
    w.write_all(&1u32.to_le_bytes())?;
    w.write_all(&[status])?;
    w.flush()
}

/// Reads one whole response frame.
pub fn read_response<R: Read>(r: &mut R) -> io::Result<WireReply> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > 1 + 4 + 4 + MAX_RESPONSE_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("response frame length {len} out of bounds"),
        ));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    match body[0] {
        STATUS_OK => {
            if body.len() < 9 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "ok response too short for metadata",
                ));
            }
            let tile_count = u32::from_le_bytes(body[1..5].try_into().expect("fixed split"));
            let bytes_consumed = u32::from_le_bytes(body[5..9].try_into().expect("fixed split"));
            Ok(Ok(WirePayload {
                tile_count,
                bytes_consumed,
                pixels: body.split_off(9),
            }))
        }
        STATUS_NOT_COMPRESSED => Ok(Err(DecodeError::NotCompressed)),
        STATUS_TRUNCATED => Ok(Err(DecodeError::Truncated)),
        STATUS_DECODER_FAULT => Ok(Err(DecodeError::DecoderFault)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown response status {other}"),
        )),
    }
}
