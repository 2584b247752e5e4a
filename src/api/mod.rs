use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use jsonrpsee::{
    core::{Error as RpcError, RpcResult},
    proc_macros::rpc,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::rib::{Family, Path};
use crate::session::{
    ApiRequest, ApiRequestKind, ApiResponse, DirectionCounts, GlobalHandle, ServerMsg,
    SessionHandle,
};
use crate::utils::{format_time_as_elapsed, nlri_to_string, origin_string};

/// Static neighbor facts for the management API
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NeighborConf {
    pub remote_ip: IpAddr,
    pub remote_as: u32,
    pub local_as: u32,
    pub remote_router_id: Option<IpAddr>,
    /// Capability codes the remote advertised in its OPEN
    pub remote_capabilities: Vec<u8>,
    /// Capability codes we advertise
    pub local_capabilities: Vec<u8>,
}

/// Live session state for the management API
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NeighborInfo {
    pub state: String,
    pub enabled: bool,
    pub received: DirectionCounts,
    pub sent: DirectionCounts,
    /// Whole seconds since the session came up; zero when unset
    pub uptime: i64,
    /// Whole seconds since the session went down; zero when unset
    pub downtime: i64,
    pub flops: u32,
    pub established_transitions: u32,
    pub negotiated_hold_time: u16,
    pub local_addr: Option<SocketAddr>,
    pub prefixes_received: u64,
    pub prefixes_accepted: u64,
    pub prefixes_advertised: u64,
    /// Instantaneous depth of the outgoing message channel
    pub out_q: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NeighborSnapshot {
    pub conf: NeighborConf,
    pub info: NeighborInfo,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RouteSnapshot {
    pub source: String,
    pub family: String,
    pub prefix: String,
    pub next_hop: Option<IpAddr>,
    pub origin: String,
    pub as_path: String,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub age: String,
    pub received_at: i64,
    pub is_withdraw: bool,
}

impl RouteSnapshot {
    pub fn from_path(path: &Path) -> Self {
        Self {
            source: path.source.to_string(),
            family: path.family.to_string(),
            prefix: nlri_to_string(&path.nlri),
            next_hop: path.next_hop,
            origin: origin_string(&path.attributes.origin).to_string(),
            as_path: path.attributes.as_path_string(),
            local_pref: path.attributes.local_pref,
            multi_exit_disc: path.attributes.multi_exit_disc,
            age: format_time_as_elapsed(path.timestamp),
            received_at: path.timestamp.timestamp(),
            is_withdraw: path.is_withdraw,
        }
    }
}

#[rpc(client, server)]
pub trait Api {
    #[method(name = "show_neighbors")]
    async fn show_neighbors(&self) -> RpcResult<Vec<NeighborSnapshot>>;
    /// Decision-process table: the global table, or a route-server
    /// client's own table when `peer` is given
    #[method(name = "show_rib")]
    async fn show_rib(&self, family: String, peer: Option<IpAddr>)
        -> RpcResult<Vec<RouteSnapshot>>;
    #[method(name = "show_routes_learned")]
    async fn show_routes_learned(
        &self,
        family: String,
        peer: Option<IpAddr>,
    ) -> RpcResult<Vec<RouteSnapshot>>;
    #[method(name = "show_routes_advertised")]
    async fn show_routes_advertised(
        &self,
        family: String,
        peer: Option<IpAddr>,
    ) -> RpcResult<Vec<RouteSnapshot>>;
    #[method(name = "neighbor_shutdown")]
    async fn neighbor_shutdown(&self, peer: IpAddr) -> RpcResult<String>;
    #[method(name = "neighbor_reset")]
    async fn neighbor_reset(&self, peer: IpAddr) -> RpcResult<String>;
    /// direction: "in", "out", or both when omitted
    #[method(name = "neighbor_soft_reset")]
    async fn neighbor_soft_reset(&self, peer: IpAddr, direction: Option<String>)
        -> RpcResult<String>;
    #[method(name = "neighbor_enable")]
    async fn neighbor_enable(&self, peer: IpAddr) -> RpcResult<String>;
    #[method(name = "neighbor_disable")]
    async fn neighbor_disable(&self, peer: IpAddr) -> RpcResult<String>;
}

/// Server-side API implementation: every request becomes a mailbox
/// message answered over a oneshot reply channel.
pub struct ApiHandler {
    peers: HashMap<IpAddr, SessionHandle>,
    global: GlobalHandle,
}

impl ApiHandler {
    pub fn new(peers: HashMap<IpAddr, SessionHandle>, global: GlobalHandle) -> Self {
        Self { peers, global }
    }

    fn parse_family(family: &str) -> RpcResult<Family> {
        family
            .parse()
            .map_err(|err: crate::utils::ParseError| RpcError::Custom(err.reason))
    }

    fn peer(&self, addr: IpAddr) -> RpcResult<&SessionHandle> {
        self.peers
            .get(&addr)
            .ok_or_else(|| RpcError::Custom(format!("No configured neighbor {}", addr)))
    }

    async fn request_peer(&self, addr: IpAddr, kind: ApiRequestKind) -> RpcResult<ApiResponse> {
        let handle = self.peer(addr)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ServerMsg::Api(ApiRequest {
            kind,
            reply: reply_tx,
        });
        handle
            .server_tx
            .send(request)
            .await
            .map_err(|_| RpcError::Custom(format!("Session {} is gone", addr)))?;
        reply_rx
            .await
            .map_err(|_| RpcError::Custom(format!("Session {} dropped the request", addr)))
    }

    async fn request_global(&self, kind: ApiRequestKind) -> RpcResult<ApiResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ServerMsg::Api(ApiRequest {
            kind,
            reply: reply_tx,
        });
        self.global
            .server_tx
            .send(request)
            .await
            .map_err(|_| RpcError::Custom("Global RIB session is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| RpcError::Custom("Global RIB dropped the request".to_string()))
    }

    async fn route_query(
        &self,
        family: Family,
        peer: Option<IpAddr>,
        kind: fn(Family) -> ApiRequestKind,
    ) -> RpcResult<Vec<RouteSnapshot>> {
        let mut routes: Vec<RouteSnapshot> = Vec::new();
        let targets: Vec<IpAddr> = match peer {
            Some(addr) => {
                self.peer(addr)?;
                vec![addr]
            }
            None => self.peers.keys().cloned().collect(),
        };
        for addr in targets {
            match self.request_peer(addr, kind(family)).await? {
                ApiResponse::Routes(mut found) => routes.append(&mut found),
                ApiResponse::Error(reason) => return Err(RpcError::Custom(reason)),
                _ => return Err(RpcError::Custom("Unexpected response".to_string())),
            }
        }
        Ok(routes)
    }

    fn ack(response: ApiResponse) -> RpcResult<String> {
        match response {
            ApiResponse::Ack => Ok("done".to_string()),
            ApiResponse::Error(reason) => Err(RpcError::Custom(reason)),
            _ => Err(RpcError::Custom("Unexpected response".to_string())),
        }
    }
}

#[async_trait]
impl ApiServer for ApiHandler {
    async fn show_neighbors(&self) -> RpcResult<Vec<NeighborSnapshot>> {
        let mut neighbors: Vec<NeighborSnapshot> = Vec::with_capacity(self.peers.len());
        let addrs: Vec<IpAddr> = self.peers.keys().cloned().collect();
        for addr in addrs {
            match self.request_peer(addr, ApiRequestKind::Neighbor).await? {
                ApiResponse::Neighbor(snapshot) => neighbors.push(*snapshot),
                _ => return Err(RpcError::Custom("Unexpected response".to_string())),
            }
        }
        neighbors.sort_by_key(|n| n.conf.remote_ip);
        Ok(neighbors)
    }

    async fn show_rib(
        &self,
        family: String,
        peer: Option<IpAddr>,
    ) -> RpcResult<Vec<RouteSnapshot>> {
        let family = Self::parse_family(&family)?;
        match peer {
            // A route-server client's own table
            Some(addr) => match self.request_peer(addr, ApiRequestKind::Rib(family)).await? {
                ApiResponse::Routes(routes) => Ok(routes),
                ApiResponse::Error(reason) => Err(RpcError::Custom(reason)),
                _ => Err(RpcError::Custom("Unexpected response".to_string())),
            },
            None => match self.request_global(ApiRequestKind::Rib(family)).await? {
                ApiResponse::Routes(routes) => Ok(routes),
                ApiResponse::Error(reason) => Err(RpcError::Custom(reason)),
                _ => Err(RpcError::Custom("Unexpected response".to_string())),
            },
        }
    }

    async fn show_routes_learned(
        &self,
        family: String,
        peer: Option<IpAddr>,
    ) -> RpcResult<Vec<RouteSnapshot>> {
        let family = Self::parse_family(&family)?;
        self.route_query(family, peer, ApiRequestKind::AdjRibIn).await
    }

    async fn show_routes_advertised(
        &self,
        family: String,
        peer: Option<IpAddr>,
    ) -> RpcResult<Vec<RouteSnapshot>> {
        let family = Self::parse_family(&family)?;
        self.route_query(family, peer, ApiRequestKind::AdjRibOut)
            .await
    }

    async fn neighbor_shutdown(&self, peer: IpAddr) -> RpcResult<String> {
        Self::ack(self.request_peer(peer, ApiRequestKind::Shutdown).await?)
    }

    async fn neighbor_reset(&self, peer: IpAddr) -> RpcResult<String> {
        Self::ack(self.request_peer(peer, ApiRequestKind::Reset).await?)
    }

    async fn neighbor_soft_reset(
        &self,
        peer: IpAddr,
        direction: Option<String>,
    ) -> RpcResult<String> {
        let kind = match direction.as_deref() {
            Some("in") => ApiRequestKind::SoftResetIn,
            Some("out") => ApiRequestKind::SoftResetOut,
            None => ApiRequestKind::SoftReset,
            Some(other) => {
                return Err(RpcError::Custom(format!(
                    "Unknown soft-reset direction '{}'",
                    other
                )))
            }
        };
        Self::ack(self.request_peer(peer, kind).await?)
    }

    async fn neighbor_enable(&self, peer: IpAddr) -> RpcResult<String> {
        Self::ack(self.request_peer(peer, ApiRequestKind::Enable).await?)
    }

    async fn neighbor_disable(&self, peer: IpAddr) -> RpcResult<String> {
        Self::ack(self.request_peer(peer, ApiRequestKind::Disable).await?)
    }
}
