//! SOCKS5 front-end (RFC 1928 subset).
//!
//! Only NO_AUTH and CMD=CONNECT are supported; address types IPv4,
//! IPv6 and DOMAINNAME are accepted. The whole handshake runs under a
//! 10 second deadline.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::LuxError;
use crate::packet::BindAddr;

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_FAILURE: u8 = 0x01;
pub const REP_NET_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Deadline for the whole method + request exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the SOCKS5 handshake and return the requested target as
/// `"host:port"` (IPv6 hosts bracketed).
///
/// On protocol errors the appropriate refusal byte is written before
/// the error is returned; the caller just closes the socket.
pub async fn handshake(stream: &mut TcpStream) -> Result<String, LuxError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake_inner(stream))
        .await
        .map_err(|_| LuxError::Timeout(HANDSHAKE_TIMEOUT))?
}

async fn handshake_inner(stream: &mut TcpStream) -> Result<String, LuxError> {
    // Method selection.
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(LuxError::Socks("invalid version in method selection"));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(LuxError::Socks("no acceptable authentication method"));
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    // Request.
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    if req[0] != VERSION {
        return Err(LuxError::Socks("invalid version in request"));
    }
    if req[1] != CMD_CONNECT {
        send_reply(stream, REP_CMD_NOT_SUPPORTED, None).await?;
        return Err(LuxError::Socks("unsupported command"));
    }

    let host = match req[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| LuxError::Socks("domain name is not utf-8"))?
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            format!("[{}]", std::net::Ipv6Addr::from(ip))
        }
        _ => {
            send_reply(stream, REP_ATYP_NOT_SUPPORTED, None).await?;
            return Err(LuxError::Socks("unsupported address type"));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let target = format!("{host}:{}", u16::from_be_bytes(port));
    debug!(%target, "socks5 handshake complete");
    Ok(target)
}

/// Write the final reply: `VER REP RSV ATYP BND.ADDR BND.PORT`.
///
/// `bind` is the remote peer's reported bound address on success; an
/// all-zero IPv4 address is sent when none is available.
pub async fn send_reply(
    stream: &mut TcpStream,
    rep: u8,
    bind: Option<BindAddr>,
) -> Result<(), LuxError> {
    let bind = bind.unwrap_or_else(BindAddr::unspecified);
    let mut resp = Vec::with_capacity(22);
    resp.push(VERSION);
    resp.push(rep);
    resp.push(0x00);
    match bind {
        BindAddr::V4(ip, port) => {
            resp.push(ATYP_IPV4);
            resp.extend_from_slice(&ip);
            resp.extend_from_slice(&port.to_be_bytes());
        }
        BindAddr::V6(ip, port) => {
            resp.push(ATYP_IPV6);
            resp.extend_from_slice(&ip);
            resp.extend_from_slice(&port.to_be_bytes());
        }
    }
    stream.write_all(&resp).await?;
    Ok(())
}

/// Map a target-dial error message onto the closest SOCKS5 reply code.
pub fn reply_code_for_dial_error(message: &str) -> u8 {
    if message.contains("refused") {
        REP_CONN_REFUSED
    } else if message.contains("unreachable") {
        REP_HOST_UNREACHABLE
    } else if message.contains("timeout") || message.contains("timed out") {
        REP_TTL_EXPIRED
    } else {
        REP_FAILURE
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Run the handshake against a scripted client, returning the
    /// resolved target and everything the server wrote back.
    async fn drive_handshake(client_bytes: &[u8]) -> (Result<String, LuxError>, Vec<u8>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let bytes = client_bytes.to_vec();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&bytes).await.unwrap();
            let mut reply = Vec::new();
            // Read whatever the server sends until it goes quiet.
            let mut buf = [0u8; 64];
            while let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(300), stream.read(&mut buf)).await
            {
                if n == 0 {
                    break;
                }
                reply.extend_from_slice(&buf[..n]);
            }
            reply
        });

        let (mut server_side, _) = listener.accept().await.unwrap();
        let result = handshake(&mut server_side).await;
        if result.is_ok() {
            // Emit a canned success so the client-side reader finishes.
            send_reply(&mut server_side, REP_SUCCESS, None).await.unwrap();
        }
        drop(server_side);
        let reply = client.await.unwrap();
        (result, reply)
    }

    #[tokio::test]
    async fn domain_handshake_resolves_target() {
        // 05 01 00 | 05 01 00 03 0A "google.com" 00 50
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 0x0A]);
        bytes.extend_from_slice(b"google.com");
        bytes.extend_from_slice(&[0x00, 0x50]);

        let (result, reply) = drive_handshake(&bytes).await;
        assert_eq!(result.unwrap(), "google.com:80");
        // Method reply then success reply.
        assert_eq!(&reply[..2], &[0x05, 0x00]);
        assert_eq!(&reply[2..5], &[0x05, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn ipv4_handshake_resolves_target() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 7, 0x1F, 0x90]);
        let (result, _) = drive_handshake(&bytes).await;
        assert_eq!(result.unwrap(), "10.0.0.7:8080");
    }

    #[tokio::test]
    async fn ipv6_target_is_bracketed() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x04]);
        bytes.extend_from_slice(&[0u8; 15]);
        bytes.push(1); // ::1
        bytes.extend_from_slice(&[0x00, 0x50]);
        let (result, _) = drive_handshake(&bytes).await;
        assert_eq!(result.unwrap(), "[::1]:80");
    }

    #[tokio::test]
    async fn rejects_missing_no_auth() {
        // Client only offers GSSAPI (0x01).
        let (result, reply) = drive_handshake(&[0x05, 0x01, 0x01]).await;
        assert!(result.is_err());
        assert_eq!(&reply[..2], &[0x05, 0xFF]);
    }

    #[tokio::test]
    async fn rejects_bind_command() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80]);
        let (result, reply) = drive_handshake(&bytes).await;
        assert!(result.is_err());
        // Method reply, then command-not-supported.
        assert_eq!(&reply[..2], &[0x05, 0x00]);
        assert_eq!(reply[3], REP_CMD_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        let (result, _) = drive_handshake(&[0x04, 0x01, 0x00]).await;
        assert!(result.is_err());
    }

    #[test]
    fn dial_error_mapping() {
        assert_eq!(reply_code_for_dial_error("connection refused"), REP_CONN_REFUSED);
        assert_eq!(reply_code_for_dial_error("host unreachable"), REP_HOST_UNREACHABLE);
        assert_eq!(reply_code_for_dial_error("dial timeout"), REP_TTL_EXPIRED);
        assert_eq!(reply_code_for_dial_error("operation timed out"), REP_TTL_EXPIRED);
        assert_eq!(reply_code_for_dial_error("something else"), REP_FAILURE);
    }
}
