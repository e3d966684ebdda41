pub mod address_pool;
pub mod cidr;
pub mod cli;
pub mod client_params;
pub mod dtls;
pub mod error;
pub mod net_setup;
pub mod supervisor;
pub mod tun_device;
pub mod tun_registry;
pub mod tunnel;
pub mod worker;
