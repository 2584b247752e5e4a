use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};

use bgp_rs::{ASPath, NLRIEncoding, Origin, PathAttribute, Segment, SAFI};
use serde::Deserialize;

use crate::policy::{Policy, PolicyAction};
use crate::rib::Family;
use crate::utils::{asn_from_dotted, prefix_from_str};

struct Defaults {}

impl Defaults {
    fn enabled() -> bool {
        true
    }

    fn passive() -> bool {
        false
    }

    fn hold_timer() -> u16 {
        180
    }

    fn connect_retry() -> u64 {
        120
    }

    fn idle_hold_time_after_reset() -> u64 {
        30
    }

    fn dest_port() -> u16 {
        179
    }

    fn api_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().expect("valid default API address")
    }

    fn families() -> Vec<Family> {
        use bgp_rs::AFI;
        vec![
            Family::new(AFI::IPV4, SAFI::Unicast),
            Family::new(AFI::IPV6, SAFI::Unicast),
        ]
    }
}

/// Config (toml) representation of a neighbor
#[derive(Clone, Debug, Deserialize)]
pub(super) struct PeerConfigSpec {
    // Peer connection details
    pub(super) remote_ip: IpAddr,
    pub(super) remote_as: u32,
    // Local connection details, deferring to server config if not provided
    pub(super) local_as: Option<u32>,
    pub(super) local_router_id: Option<IpAddr>,
    // Source address for outbound dials
    pub(super) local_addr: Option<IpAddr>,

    // Peer is configured and allowed to connect
    #[serde(default = "Defaults::enabled")]
    pub(super) enabled: bool,

    // Only accept incoming TCP sessions; don't dial out
    #[serde(default = "Defaults::passive")]
    pub(super) passive: bool,

    // Proposed hold time; keepalives go out every 1/3rd of the
    // negotiated value
    #[serde(default = "Defaults::hold_timer")]
    pub(super) hold_timer: u16,

    // Seconds between outbound connection attempts while the session
    // is Active
    #[serde(default = "Defaults::connect_retry")]
    pub(super) connect_retry: u64,

    // Seconds to linger in Idle after an administrative reset
    #[serde(default = "Defaults::idle_hold_time_after_reset")]
    pub(super) idle_hold_time_after_reset: u64,

    // Destination port used when initiating the connection
    #[serde(default = "Defaults::dest_port")]
    pub(super) dest_port: u16,

    // Run the decision process on this peer's behalf
    #[serde(default)]
    pub(super) route_server_client: bool,

    // AFI/SAFI families to exchange with this peer
    #[serde(default = "Defaults::families")]
    pub(super) families: Vec<Family>,

    #[serde(default)]
    pub(super) import_policy: Vec<String>,
    #[serde(default)]
    pub(super) export_policy: Vec<String>,
    #[serde(default)]
    pub(super) default_import: PolicyAction,
    #[serde(default)]
    pub(super) default_export: PolicyAction,

    // Locally originated routes to advertise
    #[serde(default)]
    pub(super) static_routes: Vec<RouteSpec>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerConfigSpec {
    // Global Router-ID (can be overridden per-peer)
    pub(super) router_id: IpAddr,
    // Global ASN (can be overridden per-peer)
    pub(super) local_as: u32,
    // JSON-RPC API listening address
    #[serde(default = "Defaults::api_addr")]
    pub(super) api: SocketAddr,
    #[serde(default)]
    pub(super) peers: Vec<PeerConfigSpec>,
    #[serde(default)]
    pub(super) policies: Vec<Policy>,
}

impl ServerConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: ServerConfigSpec = toml::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        Ok(config)
    }
}

/// A locally originated route, parsed from config
#[derive(Clone, Debug, Deserialize)]
pub struct RouteSpec {
    pub prefix: String,
    pub next_hop: IpAddr,
    pub origin: Option<String>,
    pub local_pref: Option<u32>,
    pub med: Option<u32>,
    #[serde(default)]
    pub as_path: Vec<String>,
    #[serde(default)]
    pub communities: Vec<u32>,
}

impl RouteSpec {
    pub fn parse(&self) -> Result<(Family, Vec<PathAttribute>, NLRIEncoding), io::Error> {
        let prefix = prefix_from_str(&self.prefix)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
        let mut attributes = vec![
            PathAttribute::NEXT_HOP(self.next_hop),
            PathAttribute::ORIGIN(
                self.origin
                    .as_ref()
                    .map(|o| match o.to_lowercase().as_str() {
                        "igp" => Origin::IGP,
                        "egp" => Origin::EGP,
                        _ => Origin::INCOMPLETE,
                    })
                    .unwrap_or(Origin::INCOMPLETE),
            ),
        ];
        if let Some(local_pref) = self.local_pref {
            attributes.push(PathAttribute::LOCAL_PREF(local_pref));
        }
        if let Some(med) = self.med {
            attributes.push(PathAttribute::MULTI_EXIT_DISC(med));
        }

        let as_path = {
            let mut asns: Vec<u32> = Vec::with_capacity(self.as_path.len());
            for asn in &self.as_path {
                asns.push(asn_from_dotted(asn).map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("Error parsing ASN: {}", err.reason),
                    )
                })?);
            }
            ASPath {
                segments: vec![Segment::AS_SEQUENCE(asns)],
            }
        };
        attributes.push(PathAttribute::AS_PATH(as_path));
        if !self.communities.is_empty() {
            attributes.push(PathAttribute::COMMUNITY(self.communities.clone()));
        }

        Ok((
            Family::new(prefix.protocol, SAFI::Unicast),
            attributes,
            NLRIEncoding::IP(prefix),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_config() {
        let config = ServerConfigSpec::from_file("./demos/config.toml").unwrap();
        assert_eq!(config.router_id, IpAddr::from(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(config.local_as, 65000);
        assert_eq!(config.peers.len(), 3);

        let v4_peer = config
            .peers
            .iter()
            .find(|p| p.remote_ip == IpAddr::from(Ipv4Addr::new(127, 0, 0, 2)))
            .unwrap();
        assert_eq!(v4_peer.local_as, Some(65000));
        assert_eq!(v4_peer.hold_timer, 90);
        assert_eq!(v4_peer.dest_port, 1179);
        assert!(v4_peer.passive);
        assert_eq!(v4_peer.import_policy, vec!["no-martians".to_string()]);

        let rs_peer = config
            .peers
            .iter()
            .find(|p| p.remote_ip == IpAddr::from(Ipv4Addr::new(127, 0, 0, 3)))
            .unwrap();
        assert!(rs_peer.route_server_client);
        assert_eq!(rs_peer.hold_timer, 180);
        assert_eq!(rs_peer.static_routes.len(), 1);
        assert_eq!(
            rs_peer.local_addr,
            Some(IpAddr::from(Ipv4Addr::new(127, 0, 0, 1)))
        );
        assert_eq!(v4_peer.local_addr, None);

        assert_eq!(config.policies.len(), 1);
        assert_eq!(config.policies[0].name, "no-martians");
    }

    #[test]
    fn test_route_spec_parse() {
        let spec = RouteSpec {
            prefix: "9.9.9.0/24".to_string(),
            next_hop: "127.0.0.1".parse().unwrap(),
            origin: Some("igp".to_string()),
            local_pref: Some(200),
            med: None,
            as_path: vec!["65000.100".to_string()],
            communities: vec![],
        };
        let (family, attributes, _nlri) = spec.parse().unwrap();
        assert_eq!(family.safi, SAFI::Unicast);
        assert!(attributes
            .iter()
            .any(|attr| matches!(attr, PathAttribute::LOCAL_PREF(200))));
    }
}
