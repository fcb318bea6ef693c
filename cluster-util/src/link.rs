//! Point-to-point links. A link is a pair of one-way byte streams to
//! one peer: an in-memory duplex pipe or a TCP connection. Frames go
//! through the same codec on both, and each direction is FIFO.

use crate::frame::{read_frame, write_frame, Frame};
use log::debug;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Bytes buffered per direction of an in-memory link
const MEMORY_LINK_BUFFER: usize = 1 << 20;

pub type DynRead = Box<dyn AsyncRead + Unpin + Send + Sync>;

pub type DynWrite = Box<dyn AsyncWrite + Unpin + Send + Sync>;

/// Both halves of a link to one peer
pub struct Link {
    pub reader: DynRead,
    pub writer: DynWrite,
}

impl Link {
    /// Two ends of an in-memory duplex link
    pub fn memory_pair() -> (Link, Link) {
        let (a, b) = tokio::io::duplex(MEMORY_LINK_BUFFER);
        (Self::split(a), Self::split(b))
    }

    /// A link over a connected TCP stream
    pub fn tcp(stream: TcpStream) -> io::Result<Link> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Link {
            reader: Box::new(BufReader::new(reader)),
            writer: Box::new(BufWriter::new(writer)),
        })
    }

    fn split<S>(stream: S) -> Link
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Link {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Drains `rx` onto the wire until every sender is gone, then shuts the
/// write side so that the peer sees end-of-stream.
pub async fn writer_loop(mut writer: DynWrite, mut rx: mpsc::UnboundedReceiver<Frame>) {
    let mut buf = Vec::new();
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&frame, &mut buf, &mut writer).await {
            debug!("write error: {}", e);
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("shutdown error: {}", e);
    }
}

/// Reads frames until the peer closes; each one goes to `on_frame`.
/// Returns the error that broke the link, if any.
pub async fn reader_loop<F>(mut reader: DynRead, mut on_frame: F) -> io::Result<()>
where
    F: FnMut(Frame) -> bool,
{
    let mut buf = Vec::new();
    while let Some(frame) = read_frame(&mut reader, &mut buf).await? {
        if !on_frame(frame) {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;

    #[tokio::test]
    async fn memory_link_is_fifo_and_closes() -> io::Result<()> {
        let (a, b) = Link::memory_pair();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_loop(a.writer, rx));

        for i in 0..10 {
            tx.send(Frame::new(FrameKind::Publish, 1, i, vec![i as u8]))
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        }
        drop(tx);

        let mut got = vec![];
        reader_loop(b.reader, |f| {
            got.push((f.tag, f.payload));
            true
        })
        .await?;

        assert_eq!(got, (0..10).map(|i| (i, vec![i as u8])).collect::<Vec<_>>());
        writer.await.map_err(io::Error::other)?;
        Ok(())
    }

    #[tokio::test]
    async fn tcp_link_carries_frames() -> io::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let client = tokio::spawn(async move {
            let link = Link::tcp(TcpStream::connect(addr).await?)?;
            let (tx, rx) = mpsc::unbounded_channel();
            tx.send(Frame::new(FrameKind::Publish, 2, 5, b"abc".to_vec()))
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            drop(tx);
            writer_loop(link.writer, rx).await;
            Ok::<(), io::Error>(())
        });

        let (stream, _) = listener.accept().await?;
        let link = Link::tcp(stream)?;
        let mut got = vec![];
        reader_loop(link.reader, |f| {
            got.push(f.payload);
            true
        })
        .await?;

        assert_eq!(got, vec![b"abc".to_vec()]);
        client.await.map_err(io::Error::other)??;
        Ok(())
    }
}
