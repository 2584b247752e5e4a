use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bgp_rs::{Message, Notification, Open, OpenCapability, OpenParameter, RouteRefresh, Segment};
use chrono::Utc;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};

use super::connect::ConnectLoop;
use super::fsm::{negotiated_hold_time, Fsm, FsmHandler};
use super::messages::{
    AdminState, ApiRequest, ApiRequestKind, ApiResponse, FsmEvent, MessageKind, PeerMsg, ServerMsg,
};
use super::{
    MessageCounters, MessageError, SessionState, BGP_ERR_CEASE, CAP_FOUR_OCTET_ASN,
    CAP_MULTIPROTOCOL, CAP_ROUTE_REFRESH, CEASE_ADMIN_RESET, CEASE_ADMIN_SHUTDOWN,
    CEASE_PEER_DECONFIGURED, FLOP_THRESHOLD_SECS, FSM_CHANNEL_LENGTH,
};
use crate::api::{NeighborConf, NeighborInfo, NeighborSnapshot, RouteSnapshot};
use crate::config::PeerConfig;
use crate::policy::{filter_path, resolve_policies, Policy, PolicyMap};
use crate::rib::path::{
    normalize_as4_attributes, paths_from_update, rewrite_two_octet_asns, update_from_path,
    validate_update,
};
use crate::rib::{AdjRib, Families, Family, Path, PeerInfo, Rib};
use crate::utils::{elapsed_seconds, get_elapsed_time, get_message_type};

pub(super) fn capability_code(capability: &OpenCapability) -> u8 {
    match capability {
        OpenCapability::MultiProtocol(_) => CAP_MULTIPROTOCOL,
        OpenCapability::RouteRefresh => CAP_ROUTE_REFRESH,
        OpenCapability::FourByteASN(_) => CAP_FOUR_OCTET_ASN,
        _ => 0,
    }
}

/// The handles a parent server keeps for one session actor
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub addr: IpAddr,
    pub conn_tx: mpsc::Sender<TcpStream>,
    pub server_tx: mpsc::Sender<ServerMsg>,
    pub peer_tx: mpsc::Sender<PeerMsg>,
    pub kill_tx: mpsc::Sender<()>,
    pub state_rx: watch::Receiver<SessionState>,
}

enum LoopExit {
    Kill,
    Transition(SessionState),
}

/// One BGP neighbor, owned end to end.
///
/// The supervisor runs a single event loop over the session mailboxes; no
/// state here needs locking. Each FSM cycle rebuilds the incoming and
/// outgoing channels so a fresh handler starts with empty queues, then
/// handles events until the FSM transitions again.
pub struct PeerSession {
    pub(crate) addr: IpAddr,
    pub(crate) config: Arc<PeerConfig>,
    pub(crate) state: SessionState,
    admin_down: bool,
    remote_router_id: Option<IpAddr>,
    /// Negotiated route families (configured ∩ remote-advertised)
    pub(crate) families: Families,
    /// Remote capabilities keyed by capability code
    pub(crate) caps: HashMap<u8, OpenCapability>,
    negotiated_hold_time: u16,
    local_addr: Option<SocketAddr>,
    idle_hold_time: u64,
    pub(crate) counters: MessageCounters,
    pub(crate) adj_rib_in: AdjRib,
    pub(crate) adj_rib_out: AdjRib,
    rib: Arc<Mutex<Rib>>,
    pub(crate) siblings: HashMap<IpAddr, mpsc::Sender<PeerMsg>>,
    import_policies: Vec<Arc<Policy>>,
    export_policies: Vec<Arc<Policy>>,
    outgoing: mpsc::Sender<Message>,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    server_rx: mpsc::Receiver<ServerMsg>,
    peer_rx: mpsc::Receiver<PeerMsg>,
    kill_rx: mpsc::Receiver<()>,
    conn_tx: mpsc::Sender<TcpStream>,
    active_tx: mpsc::Sender<()>,
    active_rx: Option<mpsc::Receiver<()>>,
    admin_tx: mpsc::Sender<AdminState>,
    fsm: Option<Fsm>,
}

impl PeerSession {
    pub fn new(
        config: Arc<PeerConfig>,
        rib: Arc<Mutex<Rib>>,
        policies: &PolicyMap,
    ) -> (Self, SessionHandle) {
        let (conn_tx, conn_rx) = mpsc::channel(4);
        let (admin_tx, admin_rx) = mpsc::channel(1);
        let (server_tx, server_rx) = mpsc::channel(FSM_CHANNEL_LENGTH);
        let (peer_tx, peer_rx) = mpsc::channel(FSM_CHANNEL_LENGTH);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (active_tx, active_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        // Replaced with a live channel on every FSM cycle
        let (outgoing, _) = mpsc::channel(FSM_CHANNEL_LENGTH);

        let fsm = Fsm::new(config.clone(), conn_rx, admin_rx);
        let handle = SessionHandle {
            addr: config.remote_ip,
            conn_tx: conn_tx.clone(),
            server_tx,
            peer_tx,
            kill_tx,
            state_rx,
        };
        let session = PeerSession {
            addr: config.remote_ip,
            admin_down: !config.enabled,
            state: SessionState::Idle,
            remote_router_id: None,
            families: Families::from(&config.families[..]),
            caps: HashMap::new(),
            negotiated_hold_time: config.hold_timer,
            local_addr: None,
            idle_hold_time: 0,
            counters: MessageCounters {
                downtime: Some(Utc::now()),
                ..MessageCounters::default()
            },
            adj_rib_in: AdjRib::new(),
            adj_rib_out: AdjRib::new(),
            rib,
            siblings: HashMap::new(),
            import_policies: resolve_policies(&config.import_policy, policies),
            export_policies: resolve_policies(&config.export_policy, policies),
            outgoing,
            state_tx,
            shutdown_tx,
            server_rx,
            peer_rx,
            kill_rx,
            conn_tx,
            active_tx,
            active_rx: Some(active_rx),
            admin_tx,
            fsm: Some(fsm),
            config,
        };
        (session, handle)
    }

    /// This session's identity as the origin of paths
    fn peer_info(&self) -> PeerInfo {
        PeerInfo::new(
            self.config.remote_as,
            self.remote_router_id
                .unwrap_or_else(|| IpAddr::from(Ipv4Addr::UNSPECIFIED)),
            self.addr,
        )
    }

    /// The supervisor event loop. Runs until the parent kills the session.
    pub async fn run(mut self) {
        if !self.config.passive {
            let active_rx = self.active_rx.take().expect("Connect loop starts once");
            ConnectLoop::spawn(
                self.config.clone(),
                self.state_tx.subscribe(),
                self.conn_tx.clone(),
                active_rx,
                self.shutdown_tx.subscribe(),
            );
        }
        loop {
            let (incoming_tx, mut incoming) = mpsc::channel::<FsmEvent>(FSM_CHANNEL_LENGTH);
            let (outgoing_tx, outgoing_rx) = mpsc::channel::<Message>(FSM_CHANNEL_LENGTH);
            self.outgoing = outgoing_tx;
            let fsm = self.fsm.take().expect("FSM present between cycles");
            let handle = FsmHandler::spawn(
                fsm,
                incoming_tx,
                outgoing_rx,
                self.shutdown_tx.subscribe(),
            );
            self.enter_state().await;

            let exit = loop {
                tokio::select! {
                    kill = self.kill_rx.recv() => {
                        let _ = kill;
                        break LoopExit::Kill;
                    }
                    event = incoming.recv() => match event {
                        Some(FsmEvent::StateChange(next)) => break LoopExit::Transition(next),
                        Some(FsmEvent::Message(message)) => self.handle_message(message).await,
                        Some(FsmEvent::MessageError(err)) => self.handle_message_error(err).await,
                        Some(FsmEvent::Sent(kind)) => self.counters.count_sent(kind),
                        None => panic!("FSM handler for {} exited without a state change", self.addr),
                    },
                    msg = self.server_rx.recv() => match msg {
                        Some(msg) => self.handle_server_msg(msg).await,
                        None => break LoopExit::Kill,
                    },
                    msg = self.peer_rx.recv() => match msg {
                        Some(msg) => self.handle_peer_msg(msg).await,
                        None => break LoopExit::Kill,
                    },
                }
            };
            match exit {
                LoopExit::Kill => {
                    self.enqueue_notification(BGP_ERR_CEASE, CEASE_PEER_DECONFIGURED)
                        .await;
                    let _ = self.shutdown_tx.send(true);
                    let _ = handle.await;
                    info!("[{}] Session stopped", self.addr);
                    return;
                }
                LoopExit::Transition(next) => {
                    // Wait for the state-scoped handler to wind down, then
                    // recover the persistent FSM state
                    let mut fsm = handle.await.expect("FSM handler completes");
                    self.handle_transition(&mut fsm, next).await;
                    self.fsm = Some(fsm);
                }
            }
        }
    }

    /// State-entry actions, run right after channels are rebuilt
    async fn enter_state(&mut self) {
        match self.state {
            SessionState::Established => {
                self.counters.uptime = Some(Utc::now());
                self.counters.established_transitions += 1;
                // Announce the full Adj-RIB-Out for each negotiated family
                let mut messages: Vec<Message> = Vec::new();
                for family in self.families.iter() {
                    messages.extend(
                        self.adj_rib_out
                            .paths(*family)
                            .iter()
                            .map(|path| Message::Update(update_from_path(path))),
                    );
                }
                self.send_messages(messages).await;
            }
            SessionState::Active => {
                if !self.config.passive {
                    // Non-blocking: a pending token already covers us
                    let _ = self.active_tx.try_send(());
                }
            }
            _ => {
                self.counters.downtime = Some(Utc::now());
            }
        }
    }

    async fn handle_transition(&mut self, fsm: &mut Fsm, next: SessionState) {
        let old = self.state;
        if old == SessionState::Established && next != SessionState::Established {
            let flapped = self
                .counters
                .uptime
                .map(|up| get_elapsed_time(up).num_seconds() < FLOP_THRESHOLD_SECS)
                .unwrap_or(false);
            if flapped {
                self.counters.flops += 1;
            }
            for family in &self.config.families {
                self.adj_rib_in.clear(*family);
            }
            self.broadcast(PeerMsg::PeerDown(self.peer_info())).await;
        }
        self.state = next;
        let _ = self.state_tx.send(next);
        self.local_addr = fsm.local_addr;
        self.negotiated_hold_time = fsm.hold_time;
        self.admin_down = fsm.admin_down;
        // An administrative reset leaves its idle hold time to apply once
        if self.idle_hold_time != 0 {
            fsm.idle_hold_time = self.idle_hold_time;
            self.idle_hold_time = 0;
        }
        if self.admin_down {
            self.counters.reset();
        }
    }

    /// Synchronous sibling fan-out: a full mailbox applies back-pressure
    /// to this whole session rather than dropping traffic
    async fn broadcast(&self, msg: PeerMsg) {
        for (addr, mailbox) in &self.siblings {
            if mailbox.send(msg.clone()).await.is_err() {
                debug!("[{}] Sibling {} mailbox closed", self.addr, addr);
            }
        }
    }

    async fn enqueue_notification(&mut self, code: u8, subcode: u8) {
        let notification = Message::Notification(Notification {
            major_err_code: code,
            minor_err_code: subcode,
            data: vec![],
        });
        let _ = self.outgoing.send(notification).await;
    }

    /// The single egress funnel for route traffic. Non-ESTABLISHED states
    /// drop silently; anything other than an UPDATE here is a bug.
    async fn send_messages(&mut self, messages: Vec<Message>) {
        for message in messages {
            if self.state != SessionState::Established {
                continue;
            }
            let mut update = match message {
                Message::Update(update) => update,
                other => panic!(
                    "sendMessages only takes UPDATEs, got {}",
                    get_message_type(&other)
                ),
            };
            if !self.caps.contains_key(&CAP_FOUR_OCTET_ASN) {
                rewrite_two_octet_asns(&mut update);
            }
            let _ = self.outgoing.send(Message::Update(update)).await;
        }
    }

    async fn handle_message(&mut self, message: Message) {
        self.counters.count_received(MessageKind::from(&message));
        match message {
            Message::Open(open) => self.handle_open(open),
            Message::Update(update) => self.handle_update(update).await,
            Message::RouteRefresh(refresh) => self.handle_route_refresh(refresh).await,
            // Keepalive pacing is the FSM driver's concern
            Message::KeepAlive => {}
            Message::Notification(notification) => {
                warn!("[{}] NOTIFICATION: {}", self.addr, notification.to_string());
            }
        }
    }

    async fn handle_message_error(&mut self, err: MessageError) {
        warn!("[{}] {}", self.addr, err);
        if err.code != 0 {
            self.enqueue_notification(err.code, err.subcode).await;
        }
    }

    /// OPEN receipt: record identity and capabilities, then reduce the
    /// family map to the intersection of both sides
    fn handle_open(&mut self, open: Open) {
        let router_id = IpAddr::from(open.identifier.to_be_bytes());
        self.remote_router_id = Some(router_id);
        let mut caps: HashMap<u8, OpenCapability> = HashMap::new();
        let mut remote_families: Vec<Family> = Vec::new();
        for parameter in &open.parameters {
            if let OpenParameter::Capabilities(capabilities) = parameter {
                for capability in capabilities {
                    if let OpenCapability::MultiProtocol((afi, safi)) = capability {
                        remote_families.push(Family::new(*afi, *safi));
                    }
                    let code = capability_code(capability);
                    if code != 0 {
                        caps.insert(code, capability.clone());
                    }
                }
            }
        }
        debug!(
            "[{}] Received OPEN [router-id {}, {} capabilities]",
            self.addr,
            router_id,
            caps.len()
        );
        self.caps = caps;
        self.families =
            Families::from(&self.config.families[..]).common(&Families::new(remote_families));
        self.negotiated_hold_time =
            negotiated_hold_time(self.config.hold_timer, open.hold_timer);
    }

    async fn handle_update(&mut self, update: bgp_rs::Update) {
        self.counters.last_update = Some(Utc::now());
        if let Err(err) = validate_update(&update, &self.families) {
            warn!("[{}] UPDATE validation failed: {}", self.addr, err);
            if err.code != 0 {
                self.enqueue_notification(err.code, err.subcode).await;
            }
            return;
        }
        let mut update = update;
        normalize_as4_attributes(&mut update);
        let paths = paths_from_update(&update, &self.peer_info());
        self.adj_rib_in.update(&paths);
        self.broadcast(PeerMsg::Paths(paths)).await;
    }

    async fn handle_route_refresh(&mut self, refresh: RouteRefresh) {
        let family = Family::new(refresh.afi, refresh.safi);
        if !self.families.contains(family) {
            warn!(
                "[{}] ROUTE-REFRESH for non-negotiated family {}, ignoring",
                self.addr, family
            );
            return;
        }
        if !self.caps.contains_key(&CAP_ROUTE_REFRESH) {
            warn!(
                "[{}] ROUTE-REFRESH without the capability advertised, ignoring",
                self.addr
            );
            return;
        }
        let messages = self
            .adj_rib_out
            .paths(family)
            .iter()
            .map(|path| Message::Update(update_from_path(path)))
            .collect();
        self.send_messages(messages).await;
    }

    /// Route traffic from a sibling session
    async fn handle_peer_msg(&mut self, msg: PeerMsg) {
        match msg {
            PeerMsg::Paths(paths) => {
                let mut accepted: Vec<Path> = Vec::with_capacity(paths.len());
                for path in paths {
                    // Withdrawals are never policy-filtered
                    if path.is_withdraw {
                        accepted.push(path);
                        continue;
                    }
                    match filter_path(&self.import_policies, self.config.default_import, &path) {
                        Some(path) => accepted.push(path),
                        None => debug!("[{}] Import policy rejected {}", self.addr, path),
                    }
                }
                let out = if self.config.route_server_client {
                    self.rib.lock().await.process_paths(accepted)
                } else {
                    accepted
                };
                self.send_update_from_paths(out).await;
            }
            PeerMsg::PeerDown(info) => {
                debug!("[{}] Peer down: {}", self.addr, info);
                let changes = {
                    let mut rib = self.rib.lock().await;
                    self.config
                        .families
                        .iter()
                        .flat_map(|family| rib.delete_paths_for_peer(&info, *family))
                        .collect::<Vec<Path>>()
                };
                self.send_update_from_paths(changes).await;
            }
        }
    }

    /// Outbound attribute rewrites per global and neighbor configuration
    fn prepare_export(&self, mut path: Path) -> Path {
        if path.is_withdraw {
            return path;
        }
        let mut attributes = (*path.attributes).clone();
        if self.config.is_ebgp() {
            let mut as_path = attributes.as_path.clone();
            if as_path.segments.is_empty() {
                as_path
                    .segments
                    .push(Segment::AS_SEQUENCE(vec![self.config.local_as]));
            } else {
                let segment = match &as_path.segments[0] {
                    Segment::AS_SEQUENCE(seq) => {
                        let mut seg = seq.clone();
                        seg.insert(0, self.config.local_as);
                        Segment::AS_SEQUENCE(seg)
                    }
                    Segment::AS_SET(set) => {
                        let mut seg = set.clone();
                        seg.insert(0, self.config.local_as);
                        Segment::AS_SET(seg)
                    }
                };
                as_path.segments[0] = segment;
            }
            attributes.as_path = as_path;
            // LOCAL_PREF stays inside the AS
            attributes.local_pref = None;
        } else {
            attributes.local_pref = Some(attributes.local_pref.unwrap_or(100));
        }
        // Locally originated paths pick up our transport address
        if attributes.next_hop.is_none() {
            attributes.next_hop = self.local_addr.map(|addr| addr.ip());
        }
        path.next_hop = attributes.next_hop;
        path.attributes = Arc::new(attributes);
        path
    }

    /// The export path: policy, Adj-RIB-Out bookkeeping, split-horizon and
    /// family gating, then conversion to UPDATEs
    async fn send_update_from_paths(&mut self, paths: Vec<Path>) {
        let mut to_send: Vec<Message> = Vec::with_capacity(paths.len());
        for path in paths {
            let path = self.prepare_export(path);
            let path = if path.is_withdraw {
                Some(path)
            } else {
                filter_path(&self.export_policies, self.config.default_export, &path)
            };
            let path = match path {
                Some(path) => path,
                None => continue,
            };
            self.adj_rib_out.update(&[path.clone()]);
            // Egress-only checks; the Adj-RIB-Out above still records the path
            if !path.is_withdraw && path.next_hop == Some(self.addr) {
                debug!(
                    "[{}] Skipping {}: next-hop points back at the peer",
                    self.addr, path
                );
                continue;
            }
            if !self.families.contains(path.family) {
                continue;
            }
            to_send.push(Message::Update(update_from_path(&path)));
        }
        self.send_messages(to_send).await;
    }

    /// Control traffic from the parent server, FIFO per channel
    async fn handle_server_msg(&mut self, msg: ServerMsg) {
        match msg {
            ServerMsg::PeerAdded { addr, mailbox } => {
                debug!("[{}] Sibling {} registered", self.addr, addr);
                self.siblings.insert(addr, mailbox.clone());
                // Baseline: everything we have heard from our neighbor
                let mut paths: Vec<Path> = Vec::new();
                for family in &self.config.families {
                    paths.extend(self.adj_rib_in.paths(*family));
                }
                if !paths.is_empty() && mailbox.send(PeerMsg::Paths(paths)).await.is_err() {
                    debug!("[{}] Sibling {} mailbox closed", self.addr, addr);
                }
            }
            ServerMsg::PeerDeleted { addr, info } => {
                debug!("[{}] Sibling {} removed", self.addr, addr);
                self.siblings.remove(&addr);
                let changes = {
                    let mut rib = self.rib.lock().await;
                    self.config
                        .families
                        .iter()
                        .flat_map(|family| rib.delete_paths_for_peer(&info, *family))
                        .collect::<Vec<Path>>()
                };
                self.send_update_from_paths(changes).await;
            }
            ServerMsg::PolicyUpdated(policies) => {
                self.import_policies = resolve_policies(&self.config.import_policy, &policies);
                self.export_policies = resolve_policies(&self.config.export_policy, &policies);
                debug!(
                    "[{}] Policies swapped: {} import, {} export",
                    self.addr,
                    self.import_policies.len(),
                    self.export_policies.len()
                );
            }
            ServerMsg::Api(request) => self.handle_api_request(request).await,
        }
    }

    async fn handle_api_request(&mut self, request: ApiRequest) {
        let response = match request.kind {
            ApiRequestKind::Neighbor => ApiResponse::Neighbor(Box::new(self.snapshot())),
            ApiRequestKind::Rib(family) => {
                if self.admin_down {
                    ApiResponse::Routes(vec![])
                } else {
                    let rib = self.rib.lock().await;
                    if rib.families().contains(&family) {
                        ApiResponse::Routes(
                            rib.get_path_list(family)
                                .iter()
                                .map(RouteSnapshot::from_path)
                                .collect(),
                        )
                    } else {
                        ApiResponse::Routes(vec![])
                    }
                }
            }
            ApiRequestKind::AdjRibIn(family) => ApiResponse::Routes(
                self.adj_rib_in
                    .paths(family)
                    .iter()
                    .map(RouteSnapshot::from_path)
                    .collect(),
            ),
            ApiRequestKind::AdjRibOut(family) => ApiResponse::Routes(
                self.adj_rib_out
                    .paths(family)
                    .iter()
                    .map(RouteSnapshot::from_path)
                    .collect(),
            ),
            ApiRequestKind::Shutdown => {
                self.enqueue_notification(BGP_ERR_CEASE, CEASE_ADMIN_SHUTDOWN)
                    .await;
                ApiResponse::Ack
            }
            ApiRequestKind::Reset => {
                self.idle_hold_time = self.config.idle_hold_time_after_reset;
                self.enqueue_notification(BGP_ERR_CEASE, CEASE_ADMIN_RESET)
                    .await;
                ApiResponse::Ack
            }
            ApiRequestKind::SoftResetIn | ApiRequestKind::SoftReset => {
                let paths = self.adj_rib_in.all_paths();
                if !paths.is_empty() {
                    self.broadcast(PeerMsg::Paths(paths)).await;
                }
                if request.kind == ApiRequestKind::SoftReset {
                    self.soft_reset_out().await;
                }
                ApiResponse::Ack
            }
            ApiRequestKind::SoftResetOut => {
                self.soft_reset_out().await;
                ApiResponse::Ack
            }
            ApiRequestKind::Enable => self.offer_admin_state(AdminState::Up),
            ApiRequestKind::Disable => self.offer_admin_state(AdminState::Down),
        };
        let _ = request.reply.send(response);
    }

    async fn soft_reset_out(&mut self) {
        let messages: Vec<Message> = self
            .adj_rib_out
            .all_paths()
            .iter()
            .map(|path| Message::Update(update_from_path(path)))
            .collect();
        self.send_messages(messages).await;
    }

    fn offer_admin_state(&mut self, state: AdminState) -> ApiResponse {
        match self.admin_tx.try_send(state) {
            Ok(()) => {
                self.admin_down = state == AdminState::Down;
                ApiResponse::Ack
            }
            Err(_) => ApiResponse::Error("previous request is still remaining".to_string()),
        }
    }

    /// Marshal peer state for the management API
    fn snapshot(&self) -> NeighborSnapshot {
        let mut remote_capabilities: Vec<u8> = self.caps.keys().cloned().collect();
        remote_capabilities.sort_unstable();
        let mut local_capabilities: Vec<u8> =
            vec![CAP_ROUTE_REFRESH, CAP_FOUR_OCTET_ASN];
        if !self.config.families.is_empty() {
            local_capabilities.insert(0, CAP_MULTIPROTOCOL);
        }
        NeighborSnapshot {
            conf: NeighborConf {
                remote_ip: self.addr,
                remote_as: self.config.remote_as,
                local_as: self.config.local_as,
                remote_router_id: self.remote_router_id,
                remote_capabilities,
                local_capabilities,
            },
            info: NeighborInfo {
                state: self.state.to_string(),
                enabled: !self.admin_down,
                received: self.counters.received,
                sent: self.counters.sent,
                uptime: elapsed_seconds(self.counters.uptime),
                downtime: elapsed_seconds(self.counters.downtime),
                flops: self.counters.flops,
                established_transitions: self.counters.established_transitions,
                negotiated_hold_time: self.negotiated_hold_time,
                local_addr: self.local_addr,
                prefixes_received: self.adj_rib_in.len() as u64,
                // Same as received: counts reflect the Adj-RIB-In
                prefixes_accepted: self.adj_rib_in.len() as u64,
                prefixes_advertised: self.adj_rib_out.len() as u64,
                out_q: FSM_CHANNEL_LENGTH - self.outgoing.capacity(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyAction, PolicyStatement};
    use crate::rib::PathAttributes;
    use crate::utils::prefix_from_str;
    use bgp_rs::{ASPath, NLRIEncoding, Origin, PathAttribute, Update, AFI, SAFI};
    use tokio::sync::oneshot;

    fn v4_unicast() -> Family {
        Family::new(AFI::IPV4, SAFI::Unicast)
    }

    fn v6_unicast() -> Family {
        Family::new(AFI::IPV6, SAFI::Unicast)
    }

    fn test_config() -> PeerConfig {
        PeerConfig {
            remote_ip: "192.0.2.1".parse().unwrap(),
            remote_as: 65001,
            local_as: 65000,
            local_router_id: "1.1.1.1".parse().unwrap(),
            local_addr: None,
            enabled: true,
            passive: true,
            hold_timer: 90,
            connect_retry: 30,
            idle_hold_time_after_reset: 30,
            dest_port: 179,
            route_server_client: false,
            families: vec![v4_unicast(), v6_unicast()],
            import_policy: vec![],
            export_policy: vec![],
            default_import: PolicyAction::Accept,
            default_export: PolicyAction::Accept,
            static_routes: vec![],
        }
    }

    struct Rig {
        session: PeerSession,
        outgoing_rx: mpsc::Receiver<Message>,
        sibling_rx: mpsc::Receiver<PeerMsg>,
    }

    fn rig_with(config: PeerConfig) -> Rig {
        let families = Families::from(&config.families[..]);
        let rib = Arc::new(Mutex::new(Rib::new(&families)));
        let policies = PolicyMap::new();
        let (mut session, _handle) = PeerSession::new(Arc::new(config), rib, &policies);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(FSM_CHANNEL_LENGTH);
        session.outgoing = outgoing_tx;
        let (sibling_tx, sibling_rx) = mpsc::channel(FSM_CHANNEL_LENGTH);
        session
            .siblings
            .insert("198.51.100.7".parse().unwrap(), sibling_tx);
        Rig {
            session,
            outgoing_rx,
            sibling_rx,
        }
    }

    fn rig() -> Rig {
        rig_with(test_config())
    }

    fn mp_open(families: &[(AFI, SAFI)], hold_time: u16) -> Open {
        let mut caps: Vec<OpenCapability> = families
            .iter()
            .map(|(afi, safi)| OpenCapability::MultiProtocol((*afi, *safi)))
            .collect();
        caps.push(OpenCapability::RouteRefresh);
        caps.push(OpenCapability::FourByteASN(65001));
        Open {
            version: 4,
            peer_asn: 65001,
            hold_timer: hold_time,
            identifier: u32::from_be_bytes([2, 2, 2, 2]),
            parameters: vec![OpenParameter::Capabilities(caps)],
        }
    }

    fn announce_update(prefix: &str, next_hop: &str) -> Update {
        Update {
            withdrawn_routes: vec![],
            attributes: vec![
                PathAttribute::ORIGIN(Origin::IGP),
                PathAttribute::NEXT_HOP(next_hop.parse().unwrap()),
                PathAttribute::AS_PATH(ASPath {
                    segments: vec![Segment::AS_SEQUENCE(vec![65001])],
                }),
            ],
            announced_routes: vec![NLRIEncoding::IP(prefix_from_str(prefix).unwrap())],
        }
    }

    fn test_path(prefix: &str, next_hop: &str) -> Path {
        let mut attributes = PathAttributes::default();
        attributes.next_hop = Some(next_hop.parse().unwrap());
        attributes.origin = Origin::IGP;
        Path::new(
            v4_unicast(),
            NLRIEncoding::IP(prefix_from_str(prefix).unwrap()),
            Arc::new(attributes),
            PeerInfo::new(
                65009,
                "9.9.9.9".parse().unwrap(),
                "198.51.100.9".parse().unwrap(),
            ),
            false,
        )
    }

    // S1: OPEN family negotiation and ROUTE-REFRESH family gating
    #[tokio::test]
    async fn open_negotiation_reduces_families() {
        let mut rig = rig();
        rig.session.state = SessionState::Established;
        rig.session
            .handle_message(Message::Open(mp_open(&[(AFI::IPV4, SAFI::Unicast)], 30)))
            .await;

        assert!(rig.session.families.contains(v4_unicast()));
        assert!(!rig.session.families.contains(v6_unicast()));
        assert_eq!(rig.session.families.len(), 1);
        // Negotiated hold time is min(local=90, remote=30)
        assert_eq!(rig.session.negotiated_hold_time, 30);
        assert_eq!(
            rig.session.remote_router_id,
            Some("2.2.2.2".parse().unwrap())
        );
        assert!(rig.session.caps.contains_key(&CAP_ROUTE_REFRESH));
        assert!(rig.session.caps.contains_key(&CAP_FOUR_OCTET_ASN));

        // ROUTE-REFRESH for the family that did not survive negotiation
        // is ignored with a warning
        rig.session
            .handle_message(Message::RouteRefresh(RouteRefresh {
                afi: AFI::IPV6,
                safi: SAFI::Unicast,
                subtype: 0,
            }))
            .await;
        assert!(rig.outgoing_rx.try_recv().is_err());
    }

    // S2: a well-formed UPDATE lands in Adj-RIB-In and fans out once
    #[tokio::test]
    async fn update_reaches_adj_rib_in_and_siblings() {
        let mut rig = rig();
        rig.session.state = SessionState::Established;
        rig.session
            .handle_message(Message::Update(announce_update("10.7.0.0/24", "192.0.2.1")))
            .await;

        assert_eq!(rig.session.adj_rib_in.len(), 1);
        match rig.sibling_rx.try_recv() {
            Ok(PeerMsg::Paths(paths)) => {
                assert_eq!(paths.len(), 1);
                assert_eq!(paths[0].next_hop, Some("192.0.2.1".parse().unwrap()));
            }
            other => panic!("Expected one PATH message, got {:?}", other),
        }
        assert!(rig.sibling_rx.try_recv().is_err());
    }

    // S3: a validator-rejected UPDATE emits its NOTIFICATION and is dropped
    #[tokio::test]
    async fn malformed_update_emits_notification() {
        let mut rig = rig();
        rig.session.state = SessionState::Established;
        let mut update = announce_update("10.7.0.0/24", "192.0.2.1");
        update.attributes = update
            .attributes
            .into_iter()
            .map(|attr| match attr {
                PathAttribute::AS_PATH(_) => PathAttribute::AS_PATH(ASPath {
                    segments: vec![Segment::AS_SEQUENCE(vec![])],
                }),
                attr => attr,
            })
            .collect();
        rig.session.handle_message(Message::Update(update)).await;

        match rig.outgoing_rx.try_recv() {
            Ok(Message::Notification(notification)) => {
                assert_eq!(notification.major_err_code, 3);
                assert_eq!(notification.minor_err_code, 11);
            }
            other => panic!("Expected NOTIFICATION(3,11), got {:?}", other),
        }
        assert_eq!(rig.session.adj_rib_in.len(), 0);
        assert!(rig.sibling_rx.try_recv().is_err());
    }

    // S4 + property 8: flap counting honors the 30s threshold
    #[tokio::test]
    async fn flaps_count_only_quick_drops() {
        let mut rig = rig();
        let (_tx, conn_rx) = mpsc::channel(1);
        let (_tx2, admin_rx) = mpsc::channel(1);
        let mut fsm = Fsm::new(rig.session.config.clone(), conn_rx, admin_rx);

        rig.session.state = SessionState::Established;
        rig.session.counters.uptime = Some(Utc::now() - chrono::Duration::seconds(5));
        rig.session
            .handle_transition(&mut fsm, SessionState::Idle)
            .await;
        assert_eq!(rig.session.counters.flops, 1);

        rig.session.state = SessionState::Established;
        rig.session.counters.uptime = Some(Utc::now() - chrono::Duration::seconds(60));
        rig.session
            .handle_transition(&mut fsm, SessionState::Idle)
            .await;
        assert_eq!(rig.session.counters.flops, 1);
    }

    // Property 3: leaving ESTABLISHED clears Adj-RIB-In and tells every
    // sibling exactly once
    #[tokio::test]
    async fn session_drop_clears_rib_and_notifies_siblings() {
        let mut rig = rig();
        let (_tx, conn_rx) = mpsc::channel(1);
        let (_tx2, admin_rx) = mpsc::channel(1);
        let mut fsm = Fsm::new(rig.session.config.clone(), conn_rx, admin_rx);

        rig.session.state = SessionState::Established;
        rig.session.counters.uptime = Some(Utc::now());
        rig.session
            .handle_message(Message::Update(announce_update("10.7.0.0/24", "192.0.2.1")))
            .await;
        assert_eq!(rig.session.adj_rib_in.len(), 1);
        // Drain the PATH fan-out
        let _ = rig.sibling_rx.try_recv();

        rig.session
            .handle_transition(&mut fsm, SessionState::Idle)
            .await;
        assert_eq!(rig.session.adj_rib_in.len(), 0);
        match rig.sibling_rx.try_recv() {
            Ok(PeerMsg::PeerDown(info)) => {
                assert_eq!(info.address, rig.session.addr);
            }
            other => panic!("Expected exactly one PEER-DOWN, got {:?}", other),
        }
        assert!(rig.sibling_rx.try_recv().is_err());
    }

    // S5: route-server import policy rejection keeps the RIB untouched
    #[tokio::test]
    async fn route_server_import_rejection() {
        let mut config = test_config();
        config.route_server_client = true;
        config.import_policy = vec!["deny-ten".to_string()];
        let mut rig = rig_with(config);
        // resolve_policies ran against an empty map; install directly
        rig.session.import_policies = vec![Arc::new(Policy {
            name: "deny-ten".to_string(),
            statements: vec![PolicyStatement {
                prefixes: vec!["10.0.0.0/8".parse().unwrap()],
                action: PolicyAction::Reject,
                set_local_pref: None,
                set_med: None,
            }],
        })];
        rig.session.state = SessionState::Established;

        let path = test_path("10.1.0.0/16", "198.51.100.9");
        rig.session.handle_peer_msg(PeerMsg::Paths(vec![path])).await;

        assert!(rig.session.rib.lock().await.is_empty());
        assert!(rig.outgoing_rx.try_recv().is_err());
        assert_eq!(rig.session.adj_rib_out.len(), 0);
    }

    // S6 + property 2: nexthop split-horizon drops at egress only
    #[tokio::test]
    async fn nexthop_split_horizon() {
        let mut rig = rig();
        rig.session.state = SessionState::Established;
        // Path whose nexthop is the neighbor's own address
        let path = test_path("10.9.0.0/16", "192.0.2.1");
        rig.session.send_update_from_paths(vec![path]).await;

        assert!(rig.outgoing_rx.try_recv().is_err());
        // Policy accepted it, so the Adj-RIB-Out still records it
        assert_eq!(rig.session.adj_rib_out.len(), 1);

        // A clean nexthop goes out
        let path = test_path("10.10.0.0/16", "198.51.100.9");
        rig.session.send_update_from_paths(vec![path]).await;
        assert!(matches!(
            rig.outgoing_rx.try_recv(),
            Ok(Message::Update(_))
        ));
    }

    // Property 6: soft resets re-emit the adjacency RIBs unchanged
    #[tokio::test]
    async fn soft_resets_reemit_ribs() {
        let mut rig = rig();
        rig.session.state = SessionState::Established;
        rig.session
            .handle_message(Message::Update(announce_update("10.7.0.0/24", "192.0.2.1")))
            .await;
        let _ = rig.sibling_rx.try_recv();
        let path = test_path("10.10.0.0/16", "198.51.100.9");
        rig.session.send_update_from_paths(vec![path]).await;
        let _ = rig.outgoing_rx.try_recv();

        let (reply_tx, _reply_rx) = oneshot::channel();
        rig.session
            .handle_api_request(ApiRequest {
                kind: ApiRequestKind::SoftResetIn,
                reply: reply_tx,
            })
            .await;
        match rig.sibling_rx.try_recv() {
            Ok(PeerMsg::Paths(paths)) => assert_eq!(paths.len(), 1),
            other => panic!("Expected re-broadcast Adj-RIB-In, got {:?}", other),
        }

        let (reply_tx, _reply_rx) = oneshot::channel();
        rig.session
            .handle_api_request(ApiRequest {
                kind: ApiRequestKind::SoftResetOut,
                reply: reply_tx,
            })
            .await;
        assert!(matches!(
            rig.outgoing_rx.try_recv(),
            Ok(Message::Update(_))
        ));
    }

    // Property 7: OutQ reports the instantaneous outgoing backlog
    #[tokio::test]
    async fn out_q_tracks_pending_messages() {
        let mut rig = rig();
        assert_eq!(rig.session.snapshot().info.out_q, 0);
        rig.session.enqueue_notification(6, 2).await;
        rig.session.enqueue_notification(6, 4).await;
        assert_eq!(rig.session.snapshot().info.out_q, 2);
        let _ = rig.outgoing_rx.try_recv();
        assert_eq!(rig.session.snapshot().info.out_q, 1);
    }

    // Admin-state channel is capacity 1: a second offer reports busy
    #[tokio::test]
    async fn admin_state_busy_reporting() {
        let mut rig = rig();
        let first = rig.session.offer_admin_state(AdminState::Down);
        assert!(matches!(first, ApiResponse::Ack));
        let second = rig.session.offer_admin_state(AdminState::Up);
        match second {
            ApiResponse::Error(reason) => {
                assert!(reason.contains("still remaining"));
            }
            other => panic!("Expected busy error, got {:?}", other),
        }
    }

    // Sibling fan-out blocks on a full mailbox instead of dropping
    #[tokio::test]
    async fn fanout_applies_backpressure() {
        use std::time::Duration;
        use tokio::time::timeout;

        let mut rig = rig();
        rig.session.state = SessionState::Established;
        let (tight_tx, mut tight_rx) = mpsc::channel(1);
        rig.session
            .siblings
            .insert("198.51.100.8".parse().unwrap(), tight_tx.clone());
        // Fill the sibling mailbox
        tight_tx
            .send(PeerMsg::PeerDown(rig.session.peer_info()))
            .await
            .unwrap();

        let update = announce_update("10.7.0.0/24", "192.0.2.1");
        let blocked = rig.session.handle_message(Message::Update(update));
        tokio::pin!(blocked);
        // The supervisor is stuck until the mailbox drains
        assert!(timeout(Duration::from_millis(50), &mut blocked)
            .await
            .is_err());
        let _ = tight_rx.recv().await;
        timeout(Duration::from_millis(200), blocked)
            .await
            .expect("fan-out resumes after drain");
    }

    // POLICY-UPDATED atomically swaps chains, skipping unknown names
    #[tokio::test]
    async fn policy_update_swaps_chains() {
        let mut config = test_config();
        config.import_policy = vec!["known".to_string(), "missing".to_string()];
        let mut rig = rig_with(config);
        assert!(rig.session.import_policies.is_empty());

        let mut map = PolicyMap::new();
        map.insert(
            "known".to_string(),
            Arc::new(Policy {
                name: "known".to_string(),
                statements: vec![],
            }),
        );
        rig.session
            .handle_server_msg(ServerMsg::PolicyUpdated(Arc::new(map)))
            .await;
        assert_eq!(rig.session.import_policies.len(), 1);
    }

    // PEER-ADDED hands the new sibling our Adj-RIB-In as a baseline
    #[tokio::test]
    async fn peer_added_baseline() {
        let mut rig = rig();
        rig.session.state = SessionState::Established;
        rig.session
            .handle_message(Message::Update(announce_update("10.7.0.0/24", "192.0.2.1")))
            .await;
        let _ = rig.sibling_rx.try_recv();

        let (new_tx, mut new_rx) = mpsc::channel(16);
        rig.session
            .handle_server_msg(ServerMsg::PeerAdded {
                addr: "198.51.100.20".parse().unwrap(),
                mailbox: new_tx,
            })
            .await;
        match new_rx.try_recv() {
            Ok(PeerMsg::Paths(paths)) => assert_eq!(paths.len(), 1),
            other => panic!("Expected baseline PATH message, got {:?}", other),
        }
    }

    // Updates rewrite to 2-octet AS paths when the capability is absent
    #[tokio::test]
    async fn two_octet_fallback_on_egress() {
        let mut rig = rig();
        rig.session.state = SessionState::Established;
        // No OPEN processed: caps is empty, 4-octet support unknown
        let mut attributes = PathAttributes::default();
        attributes.next_hop = Some("198.51.100.9".parse().unwrap());
        attributes.as_path = ASPath {
            segments: vec![Segment::AS_SEQUENCE(vec![4259840100])],
        };
        let path = Path::new(
            v4_unicast(),
            NLRIEncoding::IP(prefix_from_str("10.11.0.0/16").unwrap()),
            Arc::new(attributes),
            rig.session.peer_info(),
            false,
        );
        rig.session.send_update_from_paths(vec![path]).await;
        match rig.outgoing_rx.try_recv() {
            Ok(Message::Update(update)) => {
                let attrs =
                    PathAttributes::from_attributes(&update.attributes);
                assert!(attrs.as_path_string().contains("23456"));
            }
            other => panic!("Expected UPDATE, got {:?}", other),
        }
    }
}
