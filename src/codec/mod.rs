//! Wire framing and the control-stream message set (§4.1).
//!
//! Every control-stream message is one length-prefixed frame:
//! `[u32 length, big-endian][bincode payload]`. The payload is a
//! [`Message`], tagged by `serde`'s internal representation so the
//! discriminator travels with the bytes.

mod frame;
mod message;

pub use frame::{read_frame, read_stream_header, write_frame, write_stream_header, MAX_FRAME_SIZE};
pub use message::{AuthResultCapabilities, ErrorFrame, Message, TunnelKind};

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_every_variant() {
        let variants = vec![
            Message::Auth { token: "sk_test_123".into() },
            Message::AuthResult {
                success: true,
                error: None,
                error_code: None,
                client_id: "c1".into(),
                max_tunnels: 10,
                server_base_name: "fxtun.dev".into(),
                session_id: "s1".into(),
                session_secret: "deadbeef".into(),
                min_client_version: "1.0.0".into(),
                capabilities: AuthResultCapabilities { inspector_enabled: true },
            },
            Message::JoinSession { client_id: "c1".into(), session_secret: "deadbeef".into() },
            Message::JoinSessionResult { success: true, error: None },
            Message::TunnelRequest {
                kind: TunnelKind::Http,
                subdomain: Some("bench".into()),
                port: None,
                agent_local_port: 3000,
                name: Some("demo".into()),
                request_id: 42,
            },
            Message::TunnelCreated {
                tunnel_id: "t1".into(),
                kind: TunnelKind::Http,
                url_or_addr: "http://bench.fxtun.dev".into(),
                request_id: 42,
            },
            Message::TunnelError {
                code: crate::error::ErrorCode::SubdomainTaken,
                message: "taken".into(),
                request_id: 42,
            },
            Message::TunnelClose { tunnel_id: "t1".into() },
            Message::TunnelClosed { tunnel_id: "t1".into() },
            Message::Ping,
            Message::Pong,
            Message::ServerShutdown { reason: "maintenance".into() },
            Message::Error(ErrorFrame {
                code: crate::error::ErrorCode::ProtocolError,
                message: "bad frame".into(),
                fatal: true,
            }),
        ];

        for msg in variants {
            let (mut a, mut b) = duplex(8192);
            write_frame(&mut a, &msg).await.unwrap();
            let decoded = read_frame(&mut b).await.unwrap().expect("frame present");
            assert_eq!(
                bincode::serialize(&decoded).unwrap(),
                bincode::serialize(&msg).unwrap(),
            );
        }
    }

    #[tokio::test]
    async fn eof_before_any_frame_yields_none() {
        let (a, mut b) = duplex(8);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = duplex(8192);
        // Write a length prefix that exceeds MAX_FRAME_SIZE without a body.
        use tokio::io::AsyncWriteExt;
        a.write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, crate::error::CodecError::FrameTooLarge(_, _)));
    }
}
