use std::net::Ipv4Addr;

use clap::Parser;

use crate::cidr::Cidr;
use crate::error::{ConcentratorError, Result};
use crate::net_setup::{self, NatConfig};
use crate::supervisor::ClientParamsTemplate;

/// `<port> [-m mtu] [-a netip mask] [-d dnsip] [-r routeip routemask] [-i phys_iface]`
#[derive(Parser, Debug, Clone)]
#[command(name = "vpn-concentratord")]
#[command(about = "DTLS VPN concentrator: per-peer TUN bridging with source NAT")]
pub struct Args {
    /// UDP/DTLS service port, must be in 1..65535.
    pub port: u16,

    #[arg(short = 'm', long, default_value_t = 1400)]
    pub mtu: u16,

    #[arg(short = 'a', long = "netip", num_args = 2, default_values_t = [String::from("10.0.0.0"), String::from("8")])]
    pub netip: Vec<String>,

    #[arg(short = 'd', long = "dns", default_value = "8.8.8.8")]
    pub dns: String,

    #[arg(short = 'r', long = "route", num_args = 2, default_values_t = [String::from("0.0.0.0"), String::from("0")])]
    pub route: Vec<String>,

    /// Outbound/physical interface for the MASQUERADE rule. Defaults to
    /// `eth0` per spec, but when explicitly left unset (`--iface auto`) the
    /// route table's default interface is used instead, matching the
    /// reference crate's `get_default_interface` behavior.
    #[arg(short = 'i', long = "iface", default_value = "eth0")]
    pub phys_iface: String,

    /// PEM file containing the CA certificate used to validate optional
    /// peer certificates (server-cert-trust deployments can point this at
    /// their own server cert).
    #[arg(long = "ca", default_value = "ca.pem")]
    pub ca_file: String,

    /// PEM file containing the server's certificate chain.
    #[arg(long = "cert", default_value = "server.pem")]
    pub cert_file: String,

    /// PEM file containing the server's private key.
    #[arg(long = "key", default_value = "server-key.pem")]
    pub key_file: String,

    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

/// Validated configuration derived from `Args`. Constructing one is the
/// only place CLI input is parsed into the types the rest of the crate
/// works with; failures here are `ConfigError`, fatal at startup.
pub struct Config {
    pub port: u16,
    pub cidr: Cidr,
    pub server_ip: Ipv4Addr,
    pub params_template: ClientParamsTemplate,
    pub nat: NatConfig,
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
    pub log_level: String,
}

impl TryFrom<Args> for Config {
    type Error = ConcentratorError;

    fn try_from(args: Args) -> Result<Self> {
        if args.port == 0 {
            return Err(ConcentratorError::Config(
                "port must be in 1..65535".into(),
            ));
        }

        let server_ip: Ipv4Addr = args.netip[0]
            .parse()
            .map_err(|_| ConcentratorError::Config(format!("invalid netip: {}", args.netip[0])))?;
        let prefix_len: u8 = args.netip[1]
            .parse()
            .map_err(|_| ConcentratorError::Config(format!("invalid mask: {}", args.netip[1])))?;
        let cidr = Cidr::new(server_ip, prefix_len)
            .map_err(|e| ConcentratorError::Config(format!("invalid netip/mask: {e}")))?;

        let dns_ip: Ipv4Addr = args
            .dns
            .parse()
            .map_err(|_| ConcentratorError::Config(format!("invalid dns ip: {}", args.dns)))?;

        let route_ip: Ipv4Addr = args.route[0]
            .parse()
            .map_err(|_| ConcentratorError::Config(format!("invalid route ip: {}", args.route[0])))?;
        let route_mask: u8 = args.route[1]
            .parse()
            .map_err(|_| ConcentratorError::Config(format!("invalid route mask: {}", args.route[1])))?;

        // "auto" asks for route-table detection instead of a literal name,
        // matching the reference crate's own default-interface lookup.
        let phys_iface = if args.phys_iface == "auto" {
            net_setup::detect_default_interface()?
        } else {
            args.phys_iface
        };

        Ok(Config {
            port: args.port,
            cidr,
            server_ip,
            params_template: ClientParamsTemplate {
                mtu: args.mtu,
                dns_ip,
                route_ip,
                route_mask,
            },
            nat: NatConfig {
                subnet_cidr: format!("{}/{}", cidr.network(), cidr.prefix_len()),
                phys_iface,
            },
            ca_file: args.ca_file,
            cert_file: args.cert_file,
            key_file: args.key_file,
            log_level: args.log_level,
        })
    }
}
