use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use openssl::ssl::{
    HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslFiletype, SslMethod, SslStream,
    SslVerifyMode, SslVersion,
};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::error::{ConcentratorError, Result};

const CLIENT_WANT_CONNECT: u8 = 0x01;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(100);
const HANDSHAKE_MAX_RETRIES: u32 = 50;
const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_millis(200);
const PROBE_BUF_LEN: usize = 64;

/// Thin `Read + Write` adapter over a connected, non-blocking UDP socket so
/// openssl's (blocking-style) `SslStream` can drive a DTLS handshake and
/// record exchange over it without ever actually blocking the thread.
pub struct UdpStream {
    socket: UdpSocket,
}

impl Read for UdpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }
}

impl Write for UdpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Owns the server DTLS context (certificate chain, key, DTLS 1.2), shared
/// read-only across every tunnel worker.
pub struct DtlsListener {
    context: Arc<SslContext>,
    port: u16,
}

impl DtlsListener {
    pub fn new(
        port: u16,
        ca_file: &str,
        cert_file: &str,
        key_file: &str,
    ) -> Result<Self> {
        let mut builder = SslContext::builder(SslMethod::dtls()).map_err(ConcentratorError::Ssl)?;
        builder
            .set_min_proto_version(Some(SslVersion::DTLS1_2))
            .map_err(ConcentratorError::Ssl)?;
        builder
            .set_max_proto_version(Some(SslVersion::DTLS1_2))
            .map_err(ConcentratorError::Ssl)?;
        builder
            .set_ca_file(ca_file)
            .map_err(ConcentratorError::Ssl)?;
        builder
            .set_certificate_chain_file(cert_file)
            .map_err(ConcentratorError::Ssl)?;
        builder
            .set_private_key_file(key_file, SslFiletype::PEM)
            .map_err(ConcentratorError::Ssl)?;
        // Server-cert trust only: the CA is loaded so a peer can be
        // configured for mutual auth, but the server does not require it.
        builder.set_verify(SslVerifyMode::NONE);

        Ok(Self {
            context: Arc::new(builder.build()),
            port,
        })
    }

    /// Binds a fresh socket, waits for the connect-probe, and drives the
    /// DTLS accept handshake. Restarts with a new socket (bounded by
    /// `HANDSHAKE_MAX_RETRIES`) if the peer never completes the handshake.
    /// Observes `shutdown` at every blocking point.
    pub fn accept_one(&self, shutdown: &Arc<AtomicBool>) -> Result<SslStream<UdpStream>> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(ConcentratorError::Shutdown);
            }

            let socket = self.bind_dual_stack(shutdown)?;
            let peer_addr = match self.wait_for_probe(&socket, shutdown)? {
                Some(addr) => addr,
                None => return Err(ConcentratorError::Shutdown),
            };

            socket
                .connect(peer_addr)
                .map_err(ConcentratorError::Io)?;
            socket.set_nonblocking(true).map_err(ConcentratorError::Io)?;

            let stream = UdpStream { socket };
            match self.drive_handshake(stream, shutdown)? {
                Some(ssl) => {
                    info!(peer = %peer_addr, "dtls handshake established");
                    return Ok(ssl);
                }
                None => {
                    warn!(peer = %peer_addr, "dtls handshake exhausted retries, restarting accept");
                    continue;
                }
            }
        }
    }

    fn bind_dual_stack(&self, shutdown: &Arc<AtomicBool>) -> Result<UdpSocket> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(ConcentratorError::Shutdown);
            }
            let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
                .map_err(ConcentratorError::Io)?;
            socket.set_reuse_address(true).map_err(ConcentratorError::Io)?;
            socket.set_only_v6(false).map_err(ConcentratorError::Io)?;

            let addr: SocketAddr = format!("[::]:{}", self.port).parse().unwrap();
            match socket.bind(&addr.into()) {
                Ok(()) => return Ok(socket.into()),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!(port = self.port, "bind address in use, retrying");
                    thread::sleep(BIND_RETRY_DELAY);
                    continue;
                }
                Err(e) => return Err(ConcentratorError::Io(e)),
            }
        }
    }

    /// Blocks (the only permitted indefinite wait in the whole data plane)
    /// receiving datagrams until one is exactly the two-byte connect probe.
    fn wait_for_probe(
        &self,
        socket: &UdpSocket,
        shutdown: &Arc<AtomicBool>,
    ) -> Result<Option<SocketAddr>> {
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .map_err(ConcentratorError::Io)?;
        let mut buf = [0u8; PROBE_BUF_LEN];
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(None);
            }
            match socket.recv_from(&mut buf) {
                Ok((2, src)) if buf[0] == 0x00 && buf[1] == CLIENT_WANT_CONNECT => {
                    debug!(peer = %src, "connect probe received");
                    return Ok(Some(src));
                }
                Ok(_) => continue, // discard unrelated datagrams
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(ConcentratorError::Io(e)),
            }
        }
    }

    fn drive_handshake(
        &self,
        stream: UdpStream,
        shutdown: &Arc<AtomicBool>,
    ) -> Result<Option<SslStream<UdpStream>>> {
        let ssl = Ssl::new(&self.context).map_err(ConcentratorError::Ssl)?;

        let mut candidate = match ssl.accept(stream) {
            Ok(established) => return Ok(Some(established)),
            Err(HandshakeError::WouldBlock(mid)) => mid,
            // A malformed/non-DTLS first datagram fails the handshake
            // immediately, with no WouldBlock in between. This is just as
            // recoverable as a retry-loop failure: restart accept with a
            // fresh socket rather than treating it as fatal to the worker
            // or the process (there is no RESTART-less exit from WAITING_DTLS).
            Err(HandshakeError::Failure(e)) => {
                warn!(error = %e.into_error(), "dtls handshake failed on first attempt");
                return Ok(None);
            }
            // Unlike `Failure` (a peer-induced protocol failure), `SetupFailure`
            // means the local SSL/BIO setup itself could not even begin —
            // a configuration problem, not something a different peer or a
            // fresh socket will fix. Every probe would fail identically, so
            // this stays fatal rather than spinning the accept loop forever.
            Err(HandshakeError::SetupFailure(e)) => return Err(ConcentratorError::Ssl(e)),
        };

        for _ in 0..HANDSHAKE_MAX_RETRIES {
            if shutdown.load(Ordering::Relaxed) {
                return Err(ConcentratorError::Shutdown);
            }
            thread::sleep(HANDSHAKE_RETRY_DELAY);
            candidate = match retry_handshake(candidate) {
                RetryOutcome::Established(stream) => return Ok(Some(stream)),
                RetryOutcome::InProgress(mid) => mid,
                RetryOutcome::Failed(e) => {
                    warn!(error = %e, "dtls handshake failed mid-retry");
                    return Ok(None);
                }
            };
        }
        Ok(None)
    }
}

enum RetryOutcome {
    Established(SslStream<UdpStream>),
    InProgress(MidHandshakeSslStream<UdpStream>),
    Failed(String),
}

fn retry_handshake(mid: MidHandshakeSslStream<UdpStream>) -> RetryOutcome {
    match mid.handshake() {
        Ok(stream) => RetryOutcome::Established(stream),
        Err(HandshakeError::WouldBlock(mid)) => RetryOutcome::InProgress(mid),
        Err(HandshakeError::Failure(e)) => RetryOutcome::Failed(e.into_error().to_string()),
        Err(HandshakeError::SetupFailure(e)) => RetryOutcome::Failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_bytes_are_recognized() {
        let probe = [0x00u8, CLIENT_WANT_CONNECT];
        assert_eq!(probe.len(), 2);
        assert_eq!(probe[0], 0x00);
        assert_eq!(probe[1], 0x01);
    }
}
