//! Server role: answers CONNECT requests by dialling the target and
//! tunnelling the socket back over the visual link.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Role;
use crate::error::LuxError;
use crate::packet::{BindAddr, Packet};
use crate::peer::{
    negotiate, on_heartbeat, on_sync_while_live, teardown_epoch, LinkEvent, PeerConfig,
    PeerRuntime,
};
use crate::socks;
use crate::tunnel::{Tunnel, TunnelConfig};
use crate::video::{FrameGrab, FramePublish};

/// Outbound dial deadline.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// CONNACK emissions; the camera retains the last frame, repeats just
/// shorten the window where a heartbeat overwrites it.
const CONNACK_REPEATS: usize = 3;
/// Gap between CONNACK repeats.
const CONNACK_GAP: Duration = Duration::from_millis(100);

/// Run the server role until `shutdown` fires.
pub async fn run_server(
    cfg: PeerConfig,
    grabber: Arc<dyn FrameGrab>,
    publisher: Arc<dyn FramePublish>,
    shutdown: CancellationToken,
) -> Result<(), LuxError> {
    let (rt, mut channels) = PeerRuntime::start(Role::Server, &cfg, grabber, publisher, &shutdown);

    loop {
        match negotiate(&rt, &mut channels, &shutdown).await {
            Ok(_fps) => {}
            Err(_) if shutdown.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        }
        crate::peer::drain_stale(&mut channels);

        let epoch = shutdown.child_token();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                packet = channels.connect.recv() => {
                    match packet {
                        Some(Packet::Connect { conn_id, target, .. }) => {
                            let rt = Arc::clone(&rt);
                            let epoch = epoch.clone();
                            tokio::spawn(async move {
                                handle_connect(rt, epoch, conn_id, target).await;
                            });
                        }
                        Some(other) => debug!(packet = %other, "unexpected on CONNECT channel"),
                        None => return Ok(()),
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

        teardown_epoch(&rt, &epoch).await;
    }
}

/// Serve one CONNECT: dial the target, answer with CONNACK, and run
/// the tunnel on success.
async fn handle_connect(
    rt: Arc<PeerRuntime>,
    epoch: CancellationToken,
    conn_id: u16,
    target: String,
) {
    // The visual channel repeats frames; a CONNECT for a connection we
    // already track is an echo, not a new request.
    if rt.table.contains(conn_id).await {
        return;
    }
    let inbound = match rt.table.register(conn_id).await {
        Ok(rx) => rx,
        Err(_) => return,
    };
    info!(conn_id, %target, "connect request");

    let dialled = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await;
    let (status, bind, stream) = match dialled {
        Ok(Ok(stream)) => {
            let bind = stream
                .local_addr()
                .map(BindAddr::from)
                .unwrap_or_else(|_| BindAddr::unspecified());
            (socks::REP_SUCCESS, bind, Some(stream))
        }
        Ok(Err(e)) => {
            warn!(conn_id, %target, error = %e, "dial failed");
            (
                socks::reply_code_for_dial_error(&e.to_string()),
                BindAddr::unspecified(),
                None,
            )
        }
        Err(_) => {
            warn!(conn_id, %target, "dial timed out");
            (socks::REP_TTL_EXPIRED, BindAddr::unspecified(), None)
        }
    };

    send_connack(&rt, conn_id, status, bind).await;

    match stream {
        Some(stream) => {
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
        None => {
            rt.table.unregister(conn_id).await;
        }
    }
}

async fn send_connack(rt: &PeerRuntime, conn_id: u16, status: u8, bind: BindAddr) {
    let ack = Packet::ConnAck {
        conn_id,
        status,
        bind,
    };
    for _ in 0..CONNACK_REPEATS {
        if let Err(e) = rt.sink.send_packet(&ack) {
            warn!(conn_id, error = %e, "CONNACK emit failed");
        }
        tokio::time::sleep(CONNACK_GAP).await;
    }
}
