//! Client role: SOCKS5 listener feeding tunnels over the visual link.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Role;
use crate::error::LuxError;
use crate::packet::Packet;
use crate::peer::{
    negotiate, on_heartbeat, on_sync_while_live, teardown_epoch, LinkEvent, PeerConfig,
    PeerRuntime,
};
use crate::socks;
use crate::tunnel::{Tunnel, TunnelConfig};
use crate::video::{FrameGrab, FramePublish};

/// CONNACK wait per CONNECT emission.
const CONNACK_TIMEOUT: Duration = Duration::from_secs(5);
/// CONNECT emissions before giving up (initial send + one retransmit).
const CONNECT_ATTEMPTS: usize = 2;
/// SOCKS5 listener bind attempts before the process gives up.
const BIND_ATTEMPTS: u32 = 5;
/// Pause between bind attempts.
const BIND_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Run the client role until `shutdown` fires.
///
/// Fatal errors (an unbindable SOCKS5 port) are returned; everything
/// else (lost sessions, dead tunnels, peer restarts) is retried
/// internally forever.
pub async fn run_client(
    cfg: PeerConfig,
    grabber: Arc<dyn FrameGrab>,
    publisher: Arc<dyn FramePublish>,
    shutdown: CancellationToken,
) -> Result<(), LuxError> {
    let (rt, mut channels) = PeerRuntime::start(Role::Client, &cfg, grabber, publisher, &shutdown);

    loop {
        match negotiate(&rt, &mut channels, &shutdown).await {
            Ok(_fps) => {}
            Err(_) if shutdown.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        }
        crate::peer::drain_stale(&mut channels);

        let listener = bind_with_retries(&cfg.listen).await?;
        info!(listen = %cfg.listen, "SOCKS5 listener up");
        let epoch = shutdown.child_token();

        // Serve until the session is lost or we shut down.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "local connection accepted");
                            let rt = Arc::clone(&rt);
                            let epoch = epoch.clone();
                            tokio::spawn(async move {
                                serve_socks_conn(rt, epoch, stream).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                packet = channels.heartbeat.recv() => {
                    if on_heartbeat(&rt, packet).await == LinkEvent::SessionLost {
                        break;
                    }
                }
                packet = channels.sync.recv() => {
                    if on_sync_while_live(&rt, packet) == LinkEvent::SessionLost {
                        break;
                    }
                }
            }
        }

        drop(listener);
        teardown_epoch(&rt, &epoch).await;
    }
}

async fn bind_with_retries(addr: &str) -> Result<TcpListener, LuxError> {
    let mut last_err: Option<std::io::Error> = None;
    for attempt in 1..=BIND_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                warn!(attempt, %addr, error = %e, "SOCKS5 bind failed");
                last_err = Some(e);
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
        }
    }
    Err(last_err
        .map(LuxError::Io)
        .unwrap_or(LuxError::Other(format!("cannot bind {addr}"))))
}

/// Handle one accepted SOCKS5 connection end-to-end.
async fn serve_socks_conn(rt: Arc<PeerRuntime>, epoch: CancellationToken, mut stream: TcpStream) {
    let target = match socks::handshake(&mut stream).await {
        Ok(target) => target,
        Err(e) => {
            debug!(error = %e, "socks handshake failed");
            return;
        }
    };

    let conn_id = rt.table.allocate_id().await;
    let mut inbound = match rt.table.register(conn_id).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(conn_id, error = %e, "registration failed");
            let _ = socks::send_reply(&mut stream, socks::REP_FAILURE, None).await;
            return;
        }
    };

    info!(conn_id, %target, "requesting remote dial");
    let connect = Packet::Connect {
        conn_id,
        seq: 0,
        target: target.clone(),
    };

    // One send plus one retransmission, each with its own CONNACK wait.
    let mut ack: Option<(u8, crate::packet::BindAddr)> = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        if let Err(e) = rt.sink.send_packet(&connect) {
            warn!(conn_id, error = %e, "CONNECT emit failed");
        }
        match tokio::time::timeout(CONNACK_TIMEOUT, wait_for_connack(&mut inbound, conn_id)).await
        {
            Ok(Some(result)) => {
                ack = Some(result);
                break;
            }
            Ok(None) => break, // channel closed underneath us
            Err(_) => debug!(conn_id, attempt, "CONNACK wait timed out"),
        }
    }

    match ack {
        Some((0, bind)) => {
            if let Err(e) = socks::send_reply(&mut stream, socks::REP_SUCCESS, Some(bind)).await {
                debug!(conn_id, error = %e, "success reply failed");
                rt.table.unregister(conn_id).await;
                return;
            }
            info!(conn_id, %target, "tunnel established");
            let tunnel = Tunnel::new(
                TunnelConfig {
                    conn_id,
                    session_id: rt.session_id(),
                    hb_interval: rt.hb_interval,
                },
                Arc::clone(&rt.sink),
                rt.source.delay(),
                Arc::clone(&rt.recv_meter),
                Arc::clone(&rt.proc_meter),
                &epoch,
            );
            tunnel.run(stream, inbound).await;
            rt.table.unregister(conn_id).await;
        }
        Some((status, _)) => {
            info!(conn_id, %target, status, "remote dial failed");
            let _ = socks::send_reply(&mut stream, status, None).await;
            rt.table.unregister(conn_id).await;
        }
        None => {
            warn!(conn_id, %target, "no CONNACK; giving up");
            let _ = socks::send_reply(&mut stream, socks::REP_FAILURE, None).await;
            rt.table.unregister(conn_id).await;
        }
    }
}

/// Wait on the per-connection channel for the matching CONNACK,
/// skipping anything else that lands there first.
async fn wait_for_connack(
    inbound: &mut mpsc::Receiver<Packet>,
    conn_id: u16,
) -> Option<(u8, crate::packet::BindAddr)> {
    loop {
        match inbound.recv().await? {
            Packet::ConnAck {
                conn_id: id,
                status,
                bind,
            } if id == conn_id => return Some((status, bind)),
            other => debug!(conn_id, packet = %other, "waiting for CONNACK"),
        }
    }
}
