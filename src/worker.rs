use std::io::{Read, Write};
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::client_params::ClientParams;
use crate::error::ConcentratorError;
use crate::supervisor::Supervisor;
use crate::tunnel::Tunnel;

const CLIENT_WANT_DISCONNECT: u8 = 0x02;
const SCRATCH_LEN: usize = 32 * 1024;
const IDLE_SLEEP: Duration = Duration::from_millis(100);
const KEEPALIVE_THRESHOLD: i32 = -10_000;
const TIMEOUT_LIMIT: i32 = 60_000;

/// Spawns one `TunnelWorker` on a dedicated OS thread.
pub fn spawn(supervisor: Arc<Supervisor>) -> JoinHandle<()> {
    thread::spawn(move || run(supervisor, None))
}

/// Spawns the very first `TunnelWorker`, reporting the outcome of its
/// reserve+accept phase back over `report`. The caller (the process's
/// startup path) is the only one who needs to know whether this worker ever
/// made it to a live tunnel, since that failure is fatal to the whole
/// process: there would be nobody left to serve any client.
pub fn spawn_first(
    supervisor: Arc<Supervisor>,
) -> (JoinHandle<()>, std::sync::mpsc::Receiver<crate::error::Result<()>>) {
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = thread::spawn(move || run(supervisor, Some(tx)));
    (handle, rx)
}

fn run(supervisor: Arc<Supervisor>, report: Option<Sender<crate::error::Result<()>>>) {
    let shutdown = supervisor.shutdown_flag();
    if shutdown.load(Ordering::Relaxed) {
        if let Some(tx) = report {
            let _ = tx.send(Err(ConcentratorError::Shutdown));
        }
        return;
    }

    let reservation = match supervisor.reserve() {
        Ok(r) => r,
        Err(ConcentratorError::ResourceExhausted(msg)) => {
            warn!(reason = msg, "address pool exhausted, not accepting further tunnels");
            if let Some(tx) = report {
                let _ = tx.send(Err(ConcentratorError::ResourceExhausted(msg)));
            }
            return;
        }
        Err(e) => {
            error!(error = %e, "tunnel setup failed, worker exiting without a successor");
            if let Some(tx) = report {
                let _ = tx.send(Err(e));
            }
            return;
        }
    };

    info!(
        tun_id = %reservation.tun_id,
        server_ip = %reservation.server_ip,
        peer_ip = %reservation.peer_ip,
        "tunnel reserved, waiting for peer handshake"
    );

    let dtls = match supervisor.dtls().accept_one(&shutdown) {
        Ok(dtls) => dtls,
        Err(ConcentratorError::Shutdown) => {
            debug!("accept_one observed shutdown");
            if let Some(tx) = report {
                let _ = tx.send(Err(ConcentratorError::Shutdown));
            }
            return;
        }
        Err(e) => {
            // The reservation (addresses, id, TUN interface) is dropped
            // here along with `reservation`, returning it to the pools.
            error!(error = %e, "dtls accept failed for this tunnel");
            if let Some(tx) = report {
                let _ = tx.send(Err(e));
            }
            return;
        }
    };

    if let Some(tx) = report {
        let _ = tx.send(Ok(()));
    }

    // Spawn the successor before entering the forwarding loop: the next
    // listening socket should be up as soon as this peer stops occupying
    // the sole accept step, capping idle listeners at one.
    let next_handle = spawn(Arc::clone(&supervisor));
    supervisor.register_worker(next_handle);

    let mut tunnel = Tunnel::new(
        reservation.tun_id,
        reservation.server_ip,
        reservation.peer_ip,
        reservation.tun,
        dtls,
        supervisor.addresses(),
        supervisor.registry(),
    );

    if let Err(e) = send_client_params(&mut tunnel, &reservation.params) {
        warn!(error = %e, "failed to send initial client params");
    }

    forward(&mut tunnel, &shutdown);
    // `tunnel`'s Drop performs the full teardown sequence.
}

fn send_client_params(tunnel: &mut Tunnel, params: &ClientParams) -> std::io::Result<()> {
    let frame = params.encode();
    for _ in 0..3 {
        match tunnel.dtls.write_all(&frame) {
            Ok(()) => {}
            Err(e) if would_block(&e) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn would_block(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
}

/// How one received DTLS record classifies, per spec §6's frame table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    /// First byte non-zero: a raw IP packet bound for the TUN device.
    Payload,
    /// The two-byte `{0x00, 0x02}` graceful-close control frame.
    Disconnect,
    /// Any other zero-prefixed frame (keepalive `{0x00}` or a reserved
    /// control frame): a no-op.
    ControlNoop,
}

/// Pure frame-discrimination step (spec §8 property 4): writes to TUN iff
/// the first byte is non-zero; `{0x00, 0x02}` is disconnect; every other
/// zero-prefixed frame is ignored. `buf` must be non-empty.
fn classify_frame(buf: &[u8]) -> FrameKind {
    if buf[0] != 0x00 {
        FrameKind::Payload
    } else if buf.len() == 2 && buf[1] == CLIENT_WANT_DISCONNECT {
        FrameKind::Disconnect
    } else {
        FrameKind::ControlNoop
    }
}

/// Outcome of applying one idle tick to the adaptive timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerTick {
    timer: i32,
    send_keepalive: bool,
    timed_out: bool,
}

/// Pure timer-update step (spec §8 properties 5 and 6): grows the magnitude
/// by 100ms in the current regime's direction; crossing
/// `KEEPALIVE_THRESHOLD` asks the caller to send a three-frame keepalive
/// burst and resets to the sending regime; crossing `TIMEOUT_LIMIT` asks the
/// caller to break the forwarding loop. The two conditions are mutually
/// exclusive since a single tick can only move the timer by 100.
fn tick_timer(timer: i32) -> TimerTick {
    let mut timer = timer + if timer > 0 { 100 } else { -100 };
    let mut send_keepalive = false;
    let mut timed_out = false;

    if timer < KEEPALIVE_THRESHOLD {
        send_keepalive = true;
        timer = 1;
    } else if timer > TIMEOUT_LIMIT {
        timed_out = true;
    }

    TimerTick {
        timer,
        send_keepalive,
        timed_out,
    }
}

/// The bidirectional non-blocking forwarding engine with adaptive
/// keepalive/timeout, exactly per the data-plane state machine.
fn forward(tunnel: &mut Tunnel, shutdown: &Arc<std::sync::atomic::AtomicBool>) {
    let mut tun_buf = [0u8; SCRATCH_LEN];
    let mut dtls_buf = [0u8; SCRATCH_LEN];

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!(tun_id = %tunnel.tun_id, "worker observed shutdown");
            break;
        }

        let mut idle = true;

        match tunnel.tun.try_read(&mut tun_buf) {
            Ok(Some(n)) if n > 0 => {
                idle = false;
                if tunnel.timer < 1 {
                    tunnel.timer = 1;
                }
                if let Err(e) = tunnel.dtls.write_all(&tun_buf[..n]) {
                    if !would_block(&e) {
                        warn!(tun_id = %tunnel.tun_id, error = %e, "dtls send failed");
                        break;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(tun_id = %tunnel.tun_id, error = %e, "tun read failed");
                break;
            }
        }

        match tunnel.dtls.read(&mut dtls_buf) {
            Ok(0) => {
                debug!(tun_id = %tunnel.tun_id, "peer closed dtls association");
                break;
            }
            Ok(n) => {
                idle = false;
                if tunnel.timer > 0 {
                    tunnel.timer = 0;
                }
                match classify_frame(&dtls_buf[..n]) {
                    FrameKind::Payload => {
                        if let Err(e) = tunnel.tun.write(&dtls_buf[..n]) {
                            warn!(tun_id = %tunnel.tun_id, error = %e, "tun write failed");
                            break;
                        }
                    }
                    FrameKind::Disconnect => {
                        debug!(tun_id = %tunnel.tun_id, "peer requested disconnect");
                        break;
                    }
                    FrameKind::ControlNoop => {}
                }
            }
            Err(e) if would_block(&e) => {}
            Err(e) => {
                warn!(tun_id = %tunnel.tun_id, error = %e, "dtls recv failed");
                break;
            }
        }

        if idle {
            thread::sleep(IDLE_SLEEP);
            let tick = tick_timer(tunnel.timer);
            tunnel.timer = tick.timer;

            if tick.send_keepalive {
                for _ in 0..3 {
                    if let Err(e) = tunnel.dtls.write_all(&[0x00]) {
                        if !would_block(&e) {
                            warn!(tun_id = %tunnel.tun_id, error = %e, "keepalive send failed");
                        }
                    }
                }
            } else if tick.timed_out {
                debug!(tun_id = %tunnel.tun_id, "sending timeout, tearing down");
                break;
            }
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Frame discrimination (spec §8 property 4): the classification is
        /// exactly determined by the first byte and, for zero-prefixed
        /// frames, the total length and second byte.
        #[test]
        fn frame_discrimination(first in any::<u8>(), rest in prop::collection::vec(any::<u8>(), 0..8)) {
            let mut buf = vec![first];
            buf.extend(rest);
            let kind = classify_frame(&buf);
            if first != 0x00 {
                prop_assert_eq!(kind, FrameKind::Payload);
            } else if buf.len() == 2 && buf[1] == CLIENT_WANT_DISCONNECT {
                prop_assert_eq!(kind, FrameKind::Disconnect);
            } else {
                prop_assert_eq!(kind, FrameKind::ControlNoop);
            }
        }

        /// The keepalive and timeout conditions are mutually exclusive for
        /// any single tick, and the regime sign after a tick is never zero
        /// except immediately after a real packet resets it elsewhere.
        #[test]
        fn keepalive_and_timeout_never_fire_together(timer in -100_000i32..100_000i32) {
            let tick = tick_timer(timer);
            prop_assert!(!(tick.send_keepalive && tick.timed_out));
        }
    }
}
