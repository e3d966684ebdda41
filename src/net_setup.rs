use std::process::Command;

use tracing::{error, info, warn};

use crate::error::{ConcentratorError, Result};

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Subnet + uplink interface needed to install/remove the MASQUERADE rule.
#[derive(Clone)]
pub struct NatConfig {
    pub subnet_cidr: String,
    pub phys_iface: String,
}

impl NatConfig {
    /// Enables IP forwarding and installs the MASQUERADE rule. Best-effort
    /// removes a rule left behind by a prior run before adding the new one,
    /// so this is idempotent under retry.
    pub fn install(&self) -> Result<()> {
        info!("enabling ip forwarding");
        std::fs::write(IP_FORWARD_PATH, "1")
            .map_err(|e| ConcentratorError::OsProvisioning(format!("enable ip_forward: {e}")))?;

        let _ = self.masquerade_rule("-D"); // best-effort cleanup of a prior run
        run_iptables(&self.masquerade_args("-A"))
            .map_err(|e| ConcentratorError::OsProvisioning(format!("install MASQUERADE: {e}")))?;

        info!(subnet = %self.subnet_cidr, iface = %self.phys_iface, "NAT rule installed");
        Ok(())
    }

    /// Removes the MASQUERADE rule and restores ip_forward to 0. Called at
    /// shutdown; errors are logged, not propagated, since this runs on the
    /// best-effort teardown path.
    pub fn remove(&self) {
        if let Err(e) = self.masquerade_rule("-D") {
            warn!(error = %e, "failed to remove MASQUERADE rule");
        }
        if let Err(e) = std::fs::write(IP_FORWARD_PATH, "0") {
            error!(error = %e, "failed to restore ip_forward to 0");
        }
    }

    fn masquerade_rule(&self, action: &str) -> std::result::Result<(), String> {
        run_iptables(&self.masquerade_args(action))
    }

    fn masquerade_args(&self, action: &str) -> Vec<String> {
        vec![
            "-t".into(),
            "nat".into(),
            action.into(),
            "POSTROUTING".into(),
            "-s".into(),
            self.subnet_cidr.clone(),
            "-o".into(),
            self.phys_iface.clone(),
            "-j".into(),
            "MASQUERADE".into(),
        ]
    }
}

fn run_iptables(args: &[String]) -> std::result::Result<(), String> {
    let output = Command::new("iptables")
        .args(args)
        .output()
        .map_err(|e| format!("failed to execute iptables: {e}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// Auto-detect the outbound interface from `ip route show default`, used
/// when the CLI's `-i` flag is left at its default.
pub fn detect_default_interface() -> Result<String> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .map_err(|e| ConcentratorError::OsProvisioning(format!("ip route show default: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .split_whitespace()
        .skip_while(|&w| w != "dev")
        .nth(1)
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ConcentratorError::OsProvisioning("could not determine default interface".into())
        })
}
