mod file;

pub use file::RouteSpec;

use std::io::Result;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::policy::{PolicyAction, PolicyMap};
use crate::rib::Family;

/// Parse a TOML config file and return a ServerConfig
pub fn from_file(path: &str) -> Result<ServerConfig> {
    let spec = file::ServerConfigSpec::from_file(path)?;
    Ok(ServerConfig::from_spec(spec))
}

#[derive(Debug)]
pub struct ServerConfig {
    pub router_id: IpAddr,
    pub local_as: u32,
    pub api_addr: SocketAddr,
    pub peers: Vec<Arc<PeerConfig>>,
    pub policies: PolicyMap,
}

/// In-memory representation of a neighbor config.
///   Missing spec items are defaulted to server values.
#[derive(Debug)]
pub struct PeerConfig {
    pub remote_ip: IpAddr,
    pub remote_as: u32,
    pub local_as: u32,
    pub local_router_id: IpAddr,
    /// Source address to bind when dialing out
    pub local_addr: Option<IpAddr>,
    pub enabled: bool,
    pub passive: bool,
    pub hold_timer: u16,
    pub connect_retry: u64,
    pub idle_hold_time_after_reset: u64,
    pub dest_port: u16,
    pub route_server_client: bool,
    pub families: Vec<Family>,
    pub import_policy: Vec<String>,
    pub export_policy: Vec<String>,
    pub default_import: PolicyAction,
    pub default_export: PolicyAction,
    pub static_routes: Vec<RouteSpec>,
}

impl PeerConfig {
    // Is this an eBGP session
    pub fn is_ebgp(&self) -> bool {
        self.remote_as != self.local_as
    }
}

impl ServerConfig {
    fn from_spec(spec: file::ServerConfigSpec) -> Self {
        let peers: Vec<_> = spec
            .peers
            .iter()
            .map(|p| {
                Arc::new(PeerConfig {
                    remote_ip: p.remote_ip,
                    remote_as: p.remote_as,
                    local_as: p.local_as.unwrap_or(spec.local_as),
                    local_router_id: p.local_router_id.unwrap_or(spec.router_id),
                    local_addr: p.local_addr,
                    enabled: p.enabled,
                    passive: p.passive,
                    hold_timer: p.hold_timer,
                    connect_retry: p.connect_retry,
                    idle_hold_time_after_reset: p.idle_hold_time_after_reset,
                    dest_port: p.dest_port,
                    route_server_client: p.route_server_client,
                    families: p.families.clone(),
                    import_policy: p.import_policy.clone(),
                    export_policy: p.export_policy.clone(),
                    default_import: p.default_import,
                    default_export: p.default_export,
                    static_routes: p.static_routes.clone(),
                })
            })
            .collect();

        let policies: PolicyMap = spec
            .policies
            .into_iter()
            .map(|policy| (policy.name.clone(), Arc::new(policy)))
            .collect();

        Self {
            router_id: spec.router_id,
            local_as: spec.local_as,
            api_addr: spec.api,
            peers,
            policies,
        }
    }
}
