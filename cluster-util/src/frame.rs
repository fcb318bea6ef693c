//! Wire format shared by every link.
//!
//! ```text
//! [len: u64 BE][kind: u8][channel: u32 BE][tag: u64 BE][payload ...]
//! ```
//!
//! `len` counts everything after itself.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type LenType = u64;
const LEN_TYPE_SIZE: usize = std::mem::size_of::<LenType>();
const HEADER_SIZE: usize = 1 + 4 + 8;

/// Frames beyond this size are treated as a corrupted stream. The
/// largest real frame is one rank's dense count table in an all-gather.
pub const MAX_FRAME_LEN: usize = 512 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// TCP handshake; `tag` carries the sender's rank
    Hello = 0,
    /// one contribution to a collective; `tag` is the collective sequence
    Collective = 1,
    /// a pub/sub message
    Publish = 2,
    /// publisher to subscriber: all publishes before this one are sent
    Marker = 3,
    /// subscriber to publisher: all publishes up to the marker are handled
    Ack = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = io::Error;

    fn try_from(x: u8) -> io::Result<Self> {
        match x {
            0 => Ok(FrameKind::Hello),
            1 => Ok(FrameKind::Collective),
            2 => Ok(FrameKind::Publish),
            3 => Ok(FrameKind::Marker),
            4 => Ok(FrameKind::Ack),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame kind {}", x),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub channel: u32,
    pub tag: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, channel: u32, tag: u64, payload: Vec<u8>) -> Self {
        Self {
            kind,
            channel,
            tag,
            payload,
        }
    }

    /// A frame without payload (markers, acks, hello)
    pub fn control(kind: FrameKind, channel: u32, tag: u64) -> Self {
        Self::new(kind, channel, tag, Vec::new())
    }

    pub fn body_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append the body (no length prefix) to `buf`
    pub fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.body_len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.channel.to_be_bytes());
        buf.extend_from_slice(&self.tag.to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Parse a body produced by [`Frame::encode_body`]
    pub fn decode_body(body: &[u8]) -> io::Result<Self> {
        if body.len() < HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("frame body of {} bytes is shorter than its header", body.len()),
            ));
        }
        let kind = FrameKind::try_from(body[0])?;
        let mut channel = [0u8; 4];
        channel.copy_from_slice(&body[1..5]);
        let mut tag = [0u8; 8];
        tag.copy_from_slice(&body[5..HEADER_SIZE]);

        Ok(Self {
            kind,
            channel: u32::from_be_bytes(channel),
            tag: u64::from_be_bytes(tag),
            payload: body[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Writes the length header and the frame body into `tx`, using `buf`
/// as scratch space.
pub async fn write_frame<W>(frame: &Frame, buf: &mut Vec<u8>, tx: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    buf.clear();
    buf.extend_from_slice(&(frame.body_len() as LenType).to_be_bytes());
    frame.encode_body(buf);
    tx.write_all(buf).await?;
    tx.flush().await
}

/// Reads one frame from `rx`.
///
/// Returns `Ok(None)` when the stream ends cleanly at a frame boundary.
pub async fn read_frame<R>(rx: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LEN_TYPE_SIZE];
    let mut filled = 0;
    while filled < LEN_TYPE_SIZE {
        match rx.read(&mut header[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame header",
                ))
            }
            n => filled += n,
        }
    }

    let len = LenType::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the limit", len),
        ));
    }

    buf.resize(len, 0);
    rx.read_exact(buf).await?;
    Frame::decode_body(buf).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_of_frames() -> io::Result<()> {
        let frames = vec![
            Frame::new(FrameKind::Publish, 7, 3, b"hello".to_vec()),
            Frame::control(FrameKind::Marker, 7, 1),
            Frame::new(FrameKind::Collective, 0, u64::MAX, vec![0u8; 1000]),
        ];

        let mut wire = Vec::new();
        let mut buf = Vec::new();
        for f in &frames {
            write_frame(f, &mut buf, &mut wire).await?;
        }

        let mut src = &wire[..];
        let mut got = vec![];
        while let Some(f) = read_frame(&mut src, &mut buf).await? {
            got.push(f);
        }
        assert_eq!(got, frames);
        Ok(())
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() -> io::Result<()> {
        let mut wire = Vec::new();
        let mut buf = Vec::new();
        write_frame(
            &Frame::new(FrameKind::Publish, 1, 1, vec![1, 2, 3]),
            &mut buf,
            &mut wire,
        )
        .await?;
        wire.truncate(wire.len() - 1);
        let mut src = &wire[..];
        assert!(read_frame(&mut src, &mut buf).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn oversized_header_is_rejected_before_reading() -> io::Result<()> {
        let mut wire = ((MAX_FRAME_LEN + 1) as LenType).to_be_bytes().to_vec();
        wire.extend_from_slice(&[0u8; HEADER_SIZE]);

        let mut buf = Vec::new();
        let mut src = &wire[..];
        let err = read_frame(&mut src, &mut buf).await.err();
        assert_eq!(err.map(|e| e.kind()), Some(io::ErrorKind::InvalidData));
        assert!(buf.capacity() < MAX_FRAME_LEN);
        Ok(())
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut body = vec![9u8];
        body.extend_from_slice(&[0u8; 12]);
        assert!(Frame::decode_body(&body).is_err());
    }
}
