use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::process::Command;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ConcentratorError, Result};

/// Interface names we ever provision carry this prefix, so a crash-recovery
/// sweep can find and remove them without tracking any persisted state.
pub const IFACE_PREFIX: &str = "vpn_tun";

/// A non-negative integer, the minimal unused value at allocation time.
/// Forms the interface name `vpn_tun{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TunnelId(u32);

impl TunnelId {
    pub fn iface_name(&self) -> String {
        format!("{IFACE_PREFIX}{}", self.0)
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owns the set of live tunnel ids and, for each, the kernel interface it
/// provisioned. At most one live interface exists per id at any time.
pub struct TunRegistry {
    live: Mutex<BTreeSet<u32>>,
}

impl TunRegistry {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(BTreeSet::new()),
        }
    }

    /// Smallest non-negative id not currently live. Does not mark it live;
    /// callers must follow up with `create`.
    pub fn next_id(&self) -> TunnelId {
        let live = self.live.lock();
        let mut candidate = 0u32;
        for &id in live.iter() {
            if id == candidate {
                candidate += 1;
            } else {
                break;
            }
        }
        TunnelId(candidate)
    }

    /// Provisions `vpn_tun{id}` via the host's networking commands, assigns
    /// `server_ip peer peer_ip`, brings it up, and marks the id live.
    pub fn create(&self, id: TunnelId, server_ip: Ipv4Addr, peer_ip: Ipv4Addr) -> Result<()> {
        let name = id.iface_name();

        // Delete-before-add: idempotent under retry even if a stale
        // interface with this name survived a previous crash.
        let _ = run("ip", &["tuntap", "del", "dev", &name, "mode", "tun"]);

        run("ip", &["tuntap", "add", "dev", &name, "mode", "tun"])
            .map_err(|e| ConcentratorError::OsProvisioning(format!("tuntap add {name}: {e}")))?;

        run(
            "ifconfig",
            &[
                &name,
                &server_ip.to_string(),
                "dstaddr",
                &peer_ip.to_string(),
                "up",
            ],
        )
        .map_err(|e| ConcentratorError::OsProvisioning(format!("ifconfig {name} up: {e}")))?;

        self.live.lock().insert(id.0);
        info!(iface = %name, %server_ip, %peer_ip, "tunnel interface provisioned");
        Ok(())
    }

    /// Destroys the interface and frees the id. Idempotent.
    pub fn close(&self, id: TunnelId) {
        let name = id.iface_name();
        let _ = run("ifconfig", &[&name, "down"]);
        let _ = run("ip", &["tuntap", "del", "dev", &name, "mode", "tun"]);
        self.live.lock().remove(&id.0);
        debug!(iface = %name, "tunnel interface destroyed");
    }

    /// Removes every interface whose name begins with the reserved prefix.
    /// Called once at startup (crash recovery) and once at shutdown.
    pub fn cleanup_stale(&self) {
        let output = match Command::new("ip").args(["-o", "link", "show"]).output() {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "failed to list interfaces for stale cleanup");
                return;
            }
        };
        let text = String::from_utf8_lossy(&output.stdout);
        for line in text.lines() {
            // Typical line: "3: vpn_tun0: <POINTOPOINT,...> mtu 1400 ..."
            if let Some(rest) = line.split_once(": ") {
                let name = rest.1.split(':').next().unwrap_or("").trim();
                if let Some(stripped) = name.strip_prefix(IFACE_PREFIX) {
                    if stripped.chars().all(|c| c.is_ascii_digit()) && !stripped.is_empty() {
                        info!(iface = %name, "removing stale tunnel interface");
                        let _ = run("ifconfig", &[name, "down"]);
                        let _ = run("ip", &["tuntap", "del", "dev", name, "mode", "tun"]);
                    }
                }
            }
        }
        self.live.lock().clear();
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

impl Default for TunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn run(cmd: &str, args: &[&str]) -> std::result::Result<(), String> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| format!("failed to execute {cmd}: {e}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{cmd} {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iface_name_carries_prefix() {
        assert_eq!(TunnelId(0).iface_name(), "vpn_tun0");
        assert_eq!(TunnelId(7).iface_name(), "vpn_tun7");
    }

    #[test]
    fn next_id_is_minimal_unused() {
        let reg = TunRegistry::new();
        assert_eq!(reg.next_id(), TunnelId(0));
        reg.live.lock().insert(0);
        assert_eq!(reg.next_id(), TunnelId(1));
        reg.live.lock().insert(2);
        assert_eq!(reg.next_id(), TunnelId(1));
        reg.live.lock().insert(1);
        assert_eq!(reg.next_id(), TunnelId(3));
    }
}
