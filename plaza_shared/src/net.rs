//! Networking primitives.
//!
//! One reliable, ordered TCP stream per connection carrying length-prefixed
//! frames. Each frame body is one codec envelope (`kind` + `payload`). The
//! stream can be split so reads and writes run in separate tasks.

use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

/// Frames larger than this are refused instead of allocated.
pub const MAX_FRAME_LEN: usize = 1 << 20;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a transport connection (server side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new_unique() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        write_frame(&mut self.stream, frame).await
    }

    /// Receives one frame; `None` on clean end of stream.
    pub async fn recv(&mut self) -> anyhow::Result<Option<Bytes>> {
        read_frame(&mut self.stream).await
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into independently owned read and write halves.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        let (read, write) = self.stream.into_split();
        (FrameReader { read }, FrameWriter { write })
    }
}

/// Read half of a split connection.
#[derive(Debug)]
pub struct FrameReader {
    read: OwnedReadHalf,
}

impl FrameReader {
    pub async fn recv(&mut self) -> anyhow::Result<Option<Bytes>> {
        read_frame(&mut self.read).await
    }
}

/// Write half of a split connection.
#[derive(Debug)]
pub struct FrameWriter {
    write: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn send(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        write_frame(&mut self.write, frame).await
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.write.shutdown().await.context("tcp shutdown")
    }
}

async fn write_frame<W: AsyncWriteExt + Unpin>(w: &mut W, frame: &[u8]) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(4 + frame.len());
    buf.put_u32(frame.len() as u32);
    buf.extend_from_slice(frame);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> anyhow::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("tcp read len"),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {len} bytes exceeds limit");
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    Ok(Some(Bytes::from(payload)))
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_client, encode_client, ClientMsg};

    #[tokio::test]
    async fn frames_cross_a_socket_intact() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;

        let accept = tokio::spawn(async move {
            let (conn, _) = listener.accept().await?;
            let (mut reader, _writer) = conn.split();
            let first = reader.recv().await?;
            let second = reader.recv().await?;
            Ok::<_, anyhow::Error>((first, second))
        });

        let mut client = ReliableConn::connect(addr).await?;
        client
            .send(&encode_client(&ClientMsg::Chat {
                text: "hello".to_string(),
            }))
            .await?;
        drop(client);

        let (first, second) = accept.await??;
        let first = first.expect("one frame");
        assert_eq!(
            decode_client(&first)?,
            ClientMsg::Chat {
                text: "hello".to_string()
            }
        );
        assert!(second.is_none(), "closed stream reads as end");
        Ok(())
    }
}
