use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::address_pool::AddressPool;
use crate::client_params::ClientParams;
use crate::cidr::Cidr;
use crate::dtls::DtlsListener;
use crate::error::{ConcentratorError, Result};
use crate::net_setup::NatConfig;
use crate::tun_device::TunDevice;
use crate::tun_registry::{TunRegistry, TunnelId};
use crate::worker;

/// Template for the fields of `ClientParams` that are the same for every
/// peer (mtu, dns, pushed route); only `peer_ip` varies per tunnel.
#[derive(Clone)]
pub struct ClientParamsTemplate {
    pub mtu: u16,
    pub dns_ip: Ipv4Addr,
    pub route_ip: Ipv4Addr,
    pub route_mask: u8,
}

impl ClientParamsTemplate {
    pub fn fill(&self, peer_ip: Ipv4Addr) -> ClientParams {
        ClientParams {
            mtu: self.mtu,
            peer_ip,
            dns_ip: self.dns_ip,
            route_ip: self.route_ip,
            route_mask: self.route_mask,
        }
    }
}

/// Everything a freshly reserved (but not yet DTLS-accepted) tunnel needs
/// to proceed to the accept step.
pub struct Reservation {
    pub tun_id: TunnelId,
    pub server_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
    pub tun: TunDevice,
    pub params: ClientParams,
}

/// Holds the `AddressPool`, `TunRegistry`, and DTLS context; spawns the
/// first `TunnelWorker` and coordinates global shutdown.
pub struct Supervisor {
    addresses: Arc<AddressPool>,
    registry: Arc<TunRegistry>,
    dtls: Arc<DtlsListener>,
    params_template: ClientParamsTemplate,
    port: u16,
    nat: NatConfig,
    shutdown: Arc<AtomicBool>,
    setup_lock: Mutex<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        cidr: Cidr,
        dtls: DtlsListener,
        port: u16,
        params_template: ClientParamsTemplate,
        nat: NatConfig,
    ) -> Self {
        Self {
            addresses: Arc::new(AddressPool::new(cidr, 64)),
            registry: Arc::new(TunRegistry::new()),
            dtls: Arc::new(dtls),
            params_template,
            port,
            nat,
            shutdown: Arc::new(AtomicBool::new(false)),
            setup_lock: Mutex::new(()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Performs the compound "allocate two addresses + allocate an id +
    /// provision interface + build params" operation atomically relative to
    /// other workers, per spec's process-wide setup mutex.
    pub fn reserve(&self) -> Result<Reservation> {
        let _guard = self.setup_lock.lock();

        let server_ip = self
            .addresses
            .acquire()
            .ok_or(ConcentratorError::ResourceExhausted("no free server address"))?;
        let peer_ip = match self.addresses.acquire() {
            Some(ip) => ip,
            None => {
                self.addresses.release(server_ip);
                return Err(ConcentratorError::ResourceExhausted("no free peer address"));
            }
        };

        let tun_id = self.registry.next_id();
        if let Err(e) = self.registry.create(tun_id, server_ip, peer_ip) {
            self.addresses.release(server_ip);
            self.addresses.release(peer_ip);
            return Err(e);
        }

        let tun = match TunDevice::open(&tun_id.iface_name()) {
            Ok(tun) => tun,
            Err(e) => {
                self.registry.close(tun_id);
                self.addresses.release(server_ip);
                self.addresses.release(peer_ip);
                return Err(e);
            }
        };

        let params = self.params_template.fill(peer_ip);

        Ok(Reservation {
            tun_id,
            server_ip,
            peer_ip,
            tun,
            params,
        })
    }

    pub fn addresses(&self) -> Arc<AddressPool> {
        Arc::clone(&self.addresses)
    }

    pub fn registry(&self) -> Arc<TunRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn dtls(&self) -> Arc<DtlsListener> {
        Arc::clone(&self.dtls)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Spawns the first worker. This returns as soon as the worker thread is
    /// started, the same as every later `worker::spawn` call — it does not
    /// itself block on the peer's handshake. But per spec, this *specific*
    /// worker's inability to ever reach a live tunnel (reservation failure
    /// or `accept_one` exhausting its retries) is fatal to the whole
    /// process, since there would be nobody left to serve any client; a
    /// watcher thread observes that outcome and terminates the process if
    /// it is ever reported, leaving every later worker free to fail
    /// ordinarily (log + exit, no successor) without taking the server down.
    pub fn run_first(self: &Arc<Self>) -> Result<()> {
        self.registry.cleanup_stale();
        self.nat.install()?;

        let sup = Arc::clone(self);
        let (handle, report) = worker::spawn_first(sup);
        self.handles.lock().push(handle);

        std::thread::spawn(move || {
            // A `Shutdown` outcome means this was an intentional teardown,
            // not a failure to ever accept anyone; the process is already on
            // its way down via the ordinary shutdown path in that case.
            if let Ok(Err(e)) = report.recv() {
                if !matches!(e, ConcentratorError::Shutdown) {
                    error!(error = %e, "first tunnel worker failed to establish, exiting process");
                    std::process::exit(1);
                }
            }
        });

        Ok(())
    }

    pub fn register_worker(&self, handle: JoinHandle<()>) {
        self.handles.lock().push(handle);
    }

    /// Flips the shutdown flag, joins workers up to a bounded deadline,
    /// sweeps stale interfaces, and removes the NAT rule.
    pub fn shutdown(&self) {
        info!("supervisor shutting down");
        self.shutdown.store(true, Ordering::Relaxed);

        let deadline = Duration::from_secs(5);
        let handles = std::mem::take(&mut *self.handles.lock());
        let start = std::time::Instant::now();
        for handle in handles {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                warn!("shutdown deadline exceeded, not waiting for remaining workers");
                break;
            }
            // JoinHandle has no timed join; workers observe the shutdown
            // flag promptly at their next poll, so a plain join is bounded
            // in practice.
            if let Err(e) = handle.join() {
                error!(?e, "tunnel worker thread panicked");
            }
        }

        self.registry.cleanup_stale();
        self.nat.remove();
        info!("supervisor shutdown complete");
    }
}
