use std::net::Ipv4Addr;
use std::sync::Arc;

use openssl::ssl::SslStream;
use tracing::debug;

use crate::address_pool::AddressPool;
use crate::dtls::UdpStream;
use crate::tun_device::TunDevice;
use crate::tun_registry::{TunRegistry, TunnelId};

/// One peer's full set of live resources: a tunnel id (and its interface),
/// two addresses, a TUN fd, and a DTLS association. Owned by exactly one
/// `TunnelWorker`. Dropping it returns every resource to its pool, in the
/// order spec'd: DTLS shutdown, TUN close + interface destroy, then the
/// two addresses.
pub struct Tunnel {
    pub tun_id: TunnelId,
    pub server_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
    pub tun: TunDevice,
    pub dtls: SslStream<UdpStream>,
    /// Adaptive keepalive/timeout counter. Negative = receiving regime,
    /// positive = sending regime, magnitude = accumulated idle ms.
    pub timer: i32,

    addresses: Arc<AddressPool>,
    registry: Arc<TunRegistry>,
}

impl Tunnel {
    pub fn new(
        tun_id: TunnelId,
        server_ip: Ipv4Addr,
        peer_ip: Ipv4Addr,
        tun: TunDevice,
        dtls: SslStream<UdpStream>,
        addresses: Arc<AddressPool>,
        registry: Arc<TunRegistry>,
    ) -> Self {
        Self {
            tun_id,
            server_ip,
            peer_ip,
            tun,
            dtls,
            timer: 0,
            addresses,
            registry,
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        debug!(tun_id = %self.tun_id, "tearing down tunnel");
        // DTLS shutdown is best-effort; the stream's own Drop will also try.
        let _ = self.dtls.shutdown();
        self.registry.close(self.tun_id);
        self.addresses.release(self.server_ip);
        self.addresses.release(self.peer_ip);
    }
}
