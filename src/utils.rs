//! Wire format used for messages.
//!
//! Connection setup:
//!     - The dialer writes a fixed 12-byte preamble: magic, protocol
//!       version, offered feature bits (currently just LZ4).
//!     - The accepting side answers with the same shape; its feature bits
//!       are the intersection of what both sides offered. Frames are LZ4
//!       block compressed iff the bit survived the exchange.
//!
//! Message encoding:
//!     - Split into header and body.
//!     - The request header carries the verb, a request id and the no-wait
//!       flag; the response header carries the request id and an optional
//!       wire error. Both are encoded with bincode.
//!     - Header and body each travel as one length-delimited frame, so
//!       reading a message is two reads from the wire.
//!     - Response frames are correlated to requests by request id, which is
//!       what allows responses to complete out of order.

use std::io;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::verb::Verb;

const SETUP_MAGIC: u32 = 0x4d53_4731; // "MSG1"

pub(crate) const FEATURE_LZ4: u32 = 1 << 0;

/// Setup preamble exchanged before any frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Setup {
    pub version: i32,
    pub features: u32,
}

impl Setup {
    pub(crate) fn lz4(&self) -> bool {
        self.features & FEATURE_LZ4 != 0
    }
}

pub(crate) async fn write_setup<S: AsyncWrite + Unpin>(
    stream: &mut S,
    setup: Setup,
) -> io::Result<()> {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&SETUP_MAGIC.to_be_bytes());
    buf[4..8].copy_from_slice(&setup.version.to_be_bytes());
    buf[8..12].copy_from_slice(&setup.features.to_be_bytes());
    stream.write_all(&buf).await?;
    stream.flush().await
}

pub(crate) async fn read_setup<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Setup> {
    let mut buf = [0u8; 12];
    stream.read_exact(&mut buf).await?;
    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != SETUP_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad setup magic {magic:#010x}"),
        ));
    }
    Ok(Setup {
        version: i32::from_be_bytes(buf[4..8].try_into().unwrap()),
        features: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireRequestHeader {
    pub verb: Verb,
    pub request_id: u64,
    pub no_wait: bool,
}

/// Error answered in place of a response body. Peer-visible.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum WireError {
    UnknownVerb(Verb),
    Handler(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireResponseHeader {
    pub request_id: u64,
    pub error: Option<WireError>,
}

fn compress(frame: Bytes, lz4: bool) -> Bytes {
    if lz4 {
        Bytes::from(lz4_flex::compress_prepend_size(&frame))
    } else {
        frame
    }
}

fn decompress(frame: &[u8], lz4: bool) -> io::Result<Bytes> {
    if lz4 {
        lz4_flex::decompress_size_prepended(frame)
            .map(Bytes::from)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    } else {
        Ok(Bytes::copy_from_slice(frame))
    }
}

/// Bytes a message occupies on the wire, after compression, including the
/// two length prefixes.
fn wire_size(header: usize, body: usize) -> u64 {
    (header + body + 8) as u64
}

pub(crate) async fn write_message<T, H>(
    sink: &mut FramedWrite<T, LengthDelimitedCodec>,
    header: &H,
    body: Bytes,
    lz4: bool,
) -> io::Result<u64>
where
    T: AsyncWrite + Unpin,
    H: Serialize,
{
    let header = bincode::serialize(header).expect("serialization should not fail");
    let header = compress(Bytes::from(header), lz4);
    let body = compress(body, lz4);
    let size = wire_size(header.len(), body.len());
    sink.send(header).await?;
    sink.send(body).await?;
    Ok(size)
}

/// Reads one header/body message pair, returning the header, the body and
/// the wire footprint of the message. `Ok(None)` means the peer closed the
/// connection cleanly at a message boundary.
pub(crate) async fn read_message<T, H>(
    stream: &mut FramedRead<T, LengthDelimitedCodec>,
    lz4: bool,
) -> io::Result<Option<(H, Bytes, u64)>>
where
    T: AsyncRead + Unpin,
    H: DeserializeOwned,
{
    let header_frame = match stream.next().await {
        None => return Ok(None),
        Some(frame) => frame?,
    };
    let header = decompress(&header_frame, lz4)?;
    let header: H = bincode::deserialize(&header).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("wire header deserialization failed: {e}"),
        )
    })?;
    let body_frame = stream
        .next()
        .await
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))??;
    let size = wire_size(header_frame.len(), body_frame.len());
    let body = decompress(&body_frame, lz4)?;
    Ok(Some((header, body, size)))
}
