//! Protocol packets carried one-per-frame over the visual channel.
//!
//! Byte 0 is the type code. The four stream-related packets put the
//! 16-bit connection id at bytes 1-2 (big-endian); DATA and CONNECT add
//! a one-byte sequence number at byte 3. The control packets
//! (HEARTBEAT, SYNC, SYNC_COMPLETE) carry UTF-8 JSON bodies.
//!
//! ```text
//! 0x00 CONNECT       [id u16][seq u8][target "host:port"]
//! 0x01 CONNACK       [id u16][status u8][atyp][bind addr][port u16]
//! 0x02 DATA          [id u16][seq u8][payload]
//! 0x03 HEARTBEAT     [json]
//! 0x04 DISCONNECT    [id u16]
//! 0x05 SYNC          [json]
//! 0x06 SYNC_COMPLETE [json]
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::LuxError;

// ── Type codes ───────────────────────────────────────────────────

pub const TYPE_CONNECT: u8 = 0x00;
pub const TYPE_CONNACK: u8 = 0x01;
pub const TYPE_DATA: u8 = 0x02;
pub const TYPE_HEARTBEAT: u8 = 0x03;
pub const TYPE_DISCONNECT: u8 = 0x04;
pub const TYPE_SYNC: u8 = 0x05;
pub const TYPE_SYNC_COMPLETE: u8 = 0x06;

// ── JSON bodies ──────────────────────────────────────────────────

/// Periodic link-quality report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatBody {
    /// Frames per second this peer is decoding, as measured.
    pub fps: f32,
    /// Mean per-frame decode time in milliseconds.
    pub processing_ms: u32,
    /// Unix timestamp of emission.
    pub ts: i64,
    /// The FPS level this peer is currently sending at.
    pub target_fps: u32,
    /// The FPS this peer successfully receives from the remote.
    pub received_fps: u32,
    /// Whether this peer is ready to carry traffic.
    pub ready: bool,
    /// The sender's process-lifetime session id.
    pub session_id: i64,
    /// Monotonic heartbeat counter.
    pub seq: u64,
    /// Session phase name, for the operator's benefit.
    pub phase: String,
}

/// Flooded during session bring-up to probe the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBody {
    /// The sender's session id.
    pub session_id: i64,
    /// Random token, fresh per frame, so every sync frame is distinct.
    pub random: String,
    /// Receive rate observed so far during calibration, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measured_fps: Option<f64>,
}

/// Ends calibration: the client announces the negotiated frame rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCompleteBody {
    /// The sender's session id.
    pub session_id: i64,
    /// Calibrated frames per second both sides should capture at.
    pub fps: f64,
}

// ── BindAddr ─────────────────────────────────────────────────────

/// A SOCKS5-style bound address carried in CONNACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindAddr {
    V4([u8; 4], u16),
    V6([u8; 16], u16),
}

impl BindAddr {
    /// The SOCKS5 address-type byte.
    pub fn atyp(&self) -> u8 {
        match self {
            BindAddr::V4(..) => 0x01,
            BindAddr::V6(..) => 0x04,
        }
    }

    /// An all-zero IPv4 bind, used when no address is known.
    pub fn unspecified() -> Self {
        BindAddr::V4([0; 4], 0)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.atyp());
        match self {
            BindAddr::V4(ip, port) => {
                out.extend_from_slice(ip);
                out.extend_from_slice(&port.to_be_bytes());
            }
            BindAddr::V6(ip, port) => {
                out.extend_from_slice(ip);
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    fn decode(data: &[u8]) -> Result<Self, LuxError> {
        match data.first() {
            Some(0x01) => {
                if data.len() < 7 {
                    return Err(LuxError::InvalidPacket("short ipv4 bind address"));
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&data[1..5]);
                Ok(BindAddr::V4(ip, u16::from_be_bytes([data[5], data[6]])))
            }
            Some(0x04) => {
                if data.len() < 19 {
                    return Err(LuxError::InvalidPacket("short ipv6 bind address"));
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&data[1..17]);
                Ok(BindAddr::V6(ip, u16::from_be_bytes([data[17], data[18]])))
            }
            _ => Err(LuxError::InvalidPacket("unknown bind address type")),
        }
    }
}

impl From<SocketAddr> for BindAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => BindAddr::V4(ip.octets(), addr.port()),
            IpAddr::V6(ip) => BindAddr::V6(ip.octets(), addr.port()),
        }
    }
}

impl fmt::Display for BindAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAddr::V4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            BindAddr::V6(ip, port) => {
                let addr = std::net::Ipv6Addr::from(*ip);
                write!(f, "[{addr}]:{port}")
            }
        }
    }
}

// ── Packet ───────────────────────────────────────────────────────

/// One logical message, exchanged in one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Client asks the server to dial `target`.
    Connect {
        conn_id: u16,
        seq: u8,
        target: String,
    },
    /// Server's answer: status 0 on success, a SOCKS5 reply code
    /// otherwise, plus the locally bound address of the outbound dial.
    ConnAck {
        conn_id: u16,
        status: u8,
        bind: BindAddr,
    },
    /// A chunk of tunnel bytes.
    Data {
        conn_id: u16,
        seq: u8,
        payload: Vec<u8>,
    },
    /// Link-quality report.
    Heartbeat(HeartbeatBody),
    /// One side is done with this connection.
    Disconnect { conn_id: u16 },
    /// Session bring-up probe.
    Sync(SyncBody),
    /// Calibration result.
    SyncComplete(SyncCompleteBody),
}

impl Packet {
    /// The one-byte wire tag.
    pub fn type_code(&self) -> u8 {
        match self {
            Packet::Connect { .. } => TYPE_CONNECT,
            Packet::ConnAck { .. } => TYPE_CONNACK,
            Packet::Data { .. } => TYPE_DATA,
            Packet::Heartbeat(_) => TYPE_HEARTBEAT,
            Packet::Disconnect { .. } => TYPE_DISCONNECT,
            Packet::Sync(_) => TYPE_SYNC,
            Packet::SyncComplete(_) => TYPE_SYNC_COMPLETE,
        }
    }

    /// The connection id, for packets that carry one.
    pub fn conn_id(&self) -> Option<u16> {
        match self {
            Packet::Connect { conn_id, .. }
            | Packet::ConnAck { conn_id, .. }
            | Packet::Data { conn_id, .. }
            | Packet::Disconnect { conn_id } => Some(*conn_id),
            _ => None,
        }
    }

    /// Serialize for the visual channel.
    pub fn to_bytes(&self) -> Result<Vec<u8>, LuxError> {
        let mut out = vec![self.type_code()];
        match self {
            Packet::Connect {
                conn_id,
                seq,
                target,
            } => {
                out.extend_from_slice(&conn_id.to_be_bytes());
                out.push(*seq);
                out.extend_from_slice(target.as_bytes());
            }
            Packet::ConnAck {
                conn_id,
                status,
                bind,
            } => {
                out.extend_from_slice(&conn_id.to_be_bytes());
                out.push(*status);
                bind.encode_into(&mut out);
            }
            Packet::Data {
                conn_id,
                seq,
                payload,
            } => {
                out.extend_from_slice(&conn_id.to_be_bytes());
                out.push(*seq);
                out.extend_from_slice(payload);
            }
            Packet::Heartbeat(body) => out.append(&mut serde_json::to_vec(body)?),
            Packet::Disconnect { conn_id } => out.extend_from_slice(&conn_id.to_be_bytes()),
            Packet::Sync(body) => out.append(&mut serde_json::to_vec(body)?),
            Packet::SyncComplete(body) => out.append(&mut serde_json::to_vec(body)?),
        }
        Ok(out)
    }

    /// Parse a decoded frame payload back into a packet.
    pub fn from_bytes(data: &[u8]) -> Result<Packet, LuxError> {
        let (&code, rest) = data
            .split_first()
            .ok_or(LuxError::InvalidPacket("empty packet"))?;
        match code {
            TYPE_CONNECT => {
                if rest.len() < 3 {
                    return Err(LuxError::InvalidPacket("short CONNECT"));
                }
                let target = std::str::from_utf8(&rest[3..])
                    .map_err(|_| LuxError::InvalidPacket("CONNECT target is not utf-8"))?
                    .trim_end_matches('\0')
                    .to_string();
                Ok(Packet::Connect {
                    conn_id: u16::from_be_bytes([rest[0], rest[1]]),
                    seq: rest[2],
                    target,
                })
            }
            TYPE_CONNACK => {
                if rest.len() < 3 {
                    return Err(LuxError::InvalidPacket("short CONNACK"));
                }
                Ok(Packet::ConnAck {
                    conn_id: u16::from_be_bytes([rest[0], rest[1]]),
                    status: rest[2],
                    bind: BindAddr::decode(&rest[3..])?,
                })
            }
            TYPE_DATA => {
                if rest.len() < 3 {
                    return Err(LuxError::InvalidPacket("short DATA"));
                }
                Ok(Packet::Data {
                    conn_id: u16::from_be_bytes([rest[0], rest[1]]),
                    seq: rest[2],
                    payload: rest[3..].to_vec(),
                })
            }
            TYPE_HEARTBEAT => Ok(Packet::Heartbeat(serde_json::from_slice(rest)?)),
            TYPE_DISCONNECT => {
                if rest.len() < 2 {
                    return Err(LuxError::InvalidPacket("short DISCONNECT"));
                }
                Ok(Packet::Disconnect {
                    conn_id: u16::from_be_bytes([rest[0], rest[1]]),
                })
            }
            TYPE_SYNC => Ok(Packet::Sync(serde_json::from_slice(rest)?)),
            TYPE_SYNC_COMPLETE => Ok(Packet::SyncComplete(serde_json::from_slice(rest)?)),
            other => Err(LuxError::UnknownPacketType(other)),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Connect {
                conn_id, target, ..
            } => write!(f, "CONNECT#{conn_id} -> {target}"),
            Packet::ConnAck {
                conn_id, status, ..
            } => write!(f, "CONNACK#{conn_id} status={status}"),
            Packet::Data {
                conn_id,
                seq,
                payload,
            } => write!(f, "DATA#{conn_id} seq={seq} len={}", payload.len()),
            Packet::Heartbeat(hb) => write!(f, "HEARTBEAT sid={}", hb.session_id),
            Packet::Disconnect { conn_id } => write!(f, "DISCONNECT#{conn_id}"),
            Packet::Sync(s) => write!(f, "SYNC sid={}", s.session_id),
            Packet::SyncComplete(s) => write!(f, "SYNC_COMPLETE fps={}", s.fps),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
