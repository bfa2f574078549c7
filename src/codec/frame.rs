//! Length-prefixed frame reader/writer.

use super::message::Message;
use crate::error::CodecError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame's payload size. Large enough for any control
/// message (nothing bulky travels on the control stream — bodies go over
/// data streams) while bounding how much a misbehaving peer can make us
/// buffer.
pub const MAX_FRAME_SIZE: u32 = 1 << 20; // 1 MiB

/// Write one length-prefixed, bincode-encoded message.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), CodecError> {
    let payload = bincode::serialize(message)
        .map_err(|e| CodecError::Malformed(format!("encode: {e}")))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CodecError::FrameTooLarge(u32::MAX, MAX_FRAME_SIZE))?;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len, MAX_FRAME_SIZE));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed, bincode-encoded message.
///
/// Returns `Ok(None)` on a clean EOF before any bytes of the next frame
/// arrive (the normal way a peer closes the stream).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, CodecError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len, MAX_FRAME_SIZE));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let message: Message = bincode::deserialize(&payload)
        .map_err(|e| CodecError::Malformed(format!("decode: {e}")))?;
    Ok(Some(message))
}

/// Binary stream header the server writes before proxying a freshly opened
/// data stream: `[u16 tunnel_id_len][tunnel_id bytes][u16 addr_len][addr bytes]`.
/// Lets the agent route the raw bytes that follow to the correct local
/// target without a second control round-trip.
pub async fn write_stream_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    tunnel_id: &str,
    remote_addr: &str,
) -> Result<(), CodecError> {
    write_lp_str(writer, tunnel_id).await?;
    write_lp_str(writer, remote_addr).await?;
    Ok(())
}

pub async fn read_stream_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(String, String), CodecError> {
    let tunnel_id = read_lp_str(reader).await?;
    let remote_addr = read_lp_str(reader).await?;
    Ok((tunnel_id, remote_addr))
}

async fn write_lp_str<W: AsyncWrite + Unpin>(writer: &mut W, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len())
        .map_err(|_| CodecError::Malformed("stream header field too long".into()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(s.as_bytes()).await?;
    Ok(())
}

async fn read_lp_str<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, CodecError> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| CodecError::Malformed(format!("non-utf8 header: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn stream_header_round_trips() {
        let (mut a, mut b) = duplex(1024);
        write_stream_header(&mut a, "tun-1", "203.0.113.4:51515").await.unwrap();
        let (tid, addr) = read_stream_header(&mut b).await.unwrap();
        assert_eq!(tid, "tun-1");
        assert_eq!(addr, "203.0.113.4:51515");
    }
}
