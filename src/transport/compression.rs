//! Stream-compression negotiation.
//!
//! Each side writes a single capability byte (1 = "I support zstd
//! compression of the raw connection", 0 = no). If both wrote 1, both
//! wrap the socket in a zstd encoder/decoder pair before the multiplexer
//! starts; otherwise the connection proceeds uncompressed.

use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};

pin_project! {
    /// Wraps a split duplex IO object so reads are zstd-decompressed and
    /// writes are zstd-compressed, while still exposing a single
    /// `AsyncRead + AsyncWrite` type the multiplexer can drive.
    pub struct CompressedIo<R, W> {
        #[pin]
        reader: ZstdDecoder<BufReader<R>>,
        #[pin]
        writer: ZstdEncoder<W>,
    }
}

impl<R: AsyncRead, W: AsyncWrite> CompressedIo<R, W> {
    fn new(read_half: R, write_half: W) -> Self {
        Self {
            reader: ZstdDecoder::new(BufReader::new(read_half)),
            writer: ZstdEncoder::new(write_half),
        }
    }
}

impl<R: AsyncRead, W: AsyncWrite> AsyncRead for CompressedIo<R, W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.project().reader.poll_read(cx, buf)
    }
}

impl<R: AsyncRead, W: AsyncWrite> AsyncWrite for CompressedIo<R, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().writer.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().writer.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().writer.poll_shutdown(cx)
    }
}

/// Either the raw socket or a compressed wrapper over its split halves,
/// unified behind one type so callers don't need to be generic over it.
pub enum Negotiated<IO> {
    Plain(IO),
    Compressed(CompressedIo<tokio::io::ReadHalf<IO>, tokio::io::WriteHalf<IO>>),
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncRead for Negotiated<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Negotiated::Plain(io) => Pin::new(io).poll_read(cx, buf),
            Negotiated::Compressed(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncWrite for Negotiated<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Negotiated::Plain(io) => Pin::new(io).poll_write(cx, buf),
            Negotiated::Compressed(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Negotiated::Plain(io) => Pin::new(io).poll_flush(cx),
            Negotiated::Compressed(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Negotiated::Plain(io) => Pin::new(io).poll_shutdown(cx),
            Negotiated::Compressed(io) => Pin::new(io).poll_shutdown(cx),
        }
    }
}

/// Run the one-byte capability exchange and return the (possibly wrapped)
/// transport. `local_supports` should come from `server.compression_enabled`.
pub async fn negotiate_compression<IO>(
    mut io: IO,
    local_supports: bool,
) -> std::io::Result<Negotiated<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    io.write_u8(local_supports as u8).await?;
    io.flush().await?;
    let remote_supports = io.read_u8().await? != 0;

    if local_supports && remote_supports {
        let (read_half, write_half) = tokio::io::split(io);
        Ok(Negotiated::Compressed(CompressedIo::new(read_half, write_half)))
    } else {
        Ok(Negotiated::Plain(io))
    }
}
