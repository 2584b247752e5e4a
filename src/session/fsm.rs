use std::cmp;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bgp_rs::{Message, Notification, Open, OpenCapability, OpenParameter};
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use super::codec::{CodecError, MessageCodec, MessageProtocol};
use super::messages::{AdminState, FsmEvent, MessageKind};
use super::{
    HoldEvent, HoldTimer, SessionState, BGP_ERR_FSM, BGP_ERR_HOLD_TIMER_EXPIRED, BGP_ERR_OPEN,
};
use crate::config::PeerConfig;
use crate::rib::path::AS_TRANS;
use crate::utils::get_message_type;

/// Seconds spent in Idle before automatically moving to Active; an
/// administrative reset replaces this with the configured value once.
const DEFAULT_IDLE_HOLD_TIME: u64 = 5;

/// RFC 4271 4.2: the negotiated hold time is the lesser of what both
/// sides proposed
pub fn negotiated_hold_time(local: u16, remote: u16) -> u16 {
    cmp::min(local, remote)
}

fn router_id_u32(addr: IpAddr) -> u32 {
    match addr {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
        _ => 0,
    }
}

/// State that survives across FSM cycles.
///
/// The supervisor owns this between cycles; each cycle it moves into an
/// `FsmHandler` task and is recovered from the task's join handle after
/// the state change.
#[derive(Debug)]
pub struct Fsm {
    pub(crate) config: Arc<PeerConfig>,
    pub(crate) state: SessionState,
    pub(crate) protocol: Option<MessageProtocol>,
    pub(crate) conn_rx: mpsc::Receiver<TcpStream>,
    pub(crate) admin_rx: mpsc::Receiver<AdminState>,
    pub(crate) admin_down: bool,
    pub(crate) outbound: bool,
    pub(crate) hold_time: u16,
    pub(crate) idle_hold_time: u64,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) remote_router_id: Option<u32>,
}

impl Fsm {
    pub fn new(
        config: Arc<PeerConfig>,
        conn_rx: mpsc::Receiver<TcpStream>,
        admin_rx: mpsc::Receiver<AdminState>,
    ) -> Self {
        let admin_down = !config.enabled;
        let hold_time = config.hold_timer;
        Self {
            config,
            state: SessionState::Idle,
            protocol: None,
            conn_rx,
            admin_rx,
            admin_down,
            outbound: false,
            hold_time,
            idle_hold_time: DEFAULT_IDLE_HOLD_TIME,
            local_addr: None,
            remote_router_id: None,
        }
    }

    pub fn create_open(&self) -> Open {
        let mut capabilities: Vec<OpenCapability> =
            Vec::with_capacity(self.config.families.len() + 2);
        capabilities.extend(self.config.families.iter().map(|f| f.to_open_param()));
        capabilities.push(OpenCapability::RouteRefresh);
        capabilities.push(OpenCapability::FourByteASN(self.config.local_as));
        let two_byte_asn = if self.config.local_as < 65535 {
            self.config.local_as as u16
        } else {
            AS_TRANS as u16
        };
        Open {
            version: 4,
            peer_asn: two_byte_asn,
            hold_timer: self.config.hold_timer,
            identifier: router_id_u32(self.config.local_router_id),
            parameters: vec![OpenParameter::Capabilities(capabilities)],
        }
    }

    /// Attach a newly offered connection, replacing any current one
    fn attach(&mut self, stream: TcpStream) {
        self.outbound = stream
            .peer_addr()
            .map(|addr| addr.port() == self.config.dest_port)
            .unwrap_or(false);
        self.local_addr = stream.local_addr().ok();
        self.protocol = Some(MessageProtocol::new(stream, MessageCodec::new()));
    }

    /// Connection collision: keep the connection belonging to the side
    /// with the higher BGP Identifier. Before the remote OPEN arrives the
    /// accepted (inbound) connection wins deterministically.
    fn keep_current_connection(&self) -> bool {
        let local = router_id_u32(self.config.local_router_id);
        match self.remote_router_id {
            Some(remote) => {
                if self.outbound {
                    local > remote
                } else {
                    remote >= local
                }
            }
            None => !self.outbound,
        }
    }
}

async fn write_message(
    protocol: &mut MessageProtocol,
    incoming: &mpsc::Sender<FsmEvent>,
    addr: IpAddr,
    message: Message,
) -> Result<(), CodecError> {
    trace!("[{}] Outgoing: {}", addr, get_message_type(&message));
    let kind = MessageKind::from(&message);
    protocol.send(message).await?;
    let _ = incoming.send(FsmEvent::Sent(kind)).await;
    Ok(())
}

/// Check the 4-byte ASN capability first, fall back to the 2-byte field
fn asn_from_open(open: &Open) -> u32 {
    open.parameters
        .iter()
        .flat_map(|parameter| match parameter {
            OpenParameter::Capabilities(caps) => caps.clone(),
            _ => vec![],
        })
        .find_map(|capability| match capability {
            OpenCapability::FourByteASN(asn) => Some(asn),
            _ => None,
        })
        .unwrap_or_else(|| u32::from(open.peer_asn))
}

fn notification(code: u8, subcode: u8) -> Message {
    Message::Notification(Notification {
        major_err_code: code,
        minor_err_code: subcode,
        data: vec![],
    })
}

/// Drives one FSM state to its next transition.
///
/// Spawned per cycle by the session supervisor with fresh incoming and
/// outgoing channels, so stale traffic from a previous state dies with
/// that state's channels.
pub struct FsmHandler {
    fsm: Fsm,
    incoming: mpsc::Sender<FsmEvent>,
    outgoing: mpsc::Receiver<Message>,
    shutdown: watch::Receiver<bool>,
}

impl FsmHandler {
    pub fn spawn(
        fsm: Fsm,
        incoming: mpsc::Sender<FsmEvent>,
        outgoing: mpsc::Receiver<Message>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Fsm> {
        let handler = FsmHandler {
            fsm,
            incoming,
            outgoing,
            shutdown,
        };
        tokio::spawn(handler.run())
    }

    async fn run(mut self) -> Fsm {
        let addr = self.fsm.config.remote_ip;
        let next = match self.fsm.state {
            SessionState::Idle => self.run_idle().await,
            SessionState::Connect | SessionState::Active => self.run_active().await,
            SessionState::OpenSent => self.run_open_sent().await,
            SessionState::OpenConfirm => self.run_open_confirm().await,
            SessionState::Established => self.run_established().await,
        };
        if let Some(next_state) = next {
            debug!("{} went from {} to {}", addr, self.fsm.state, next_state);
            self.fsm.state = next_state;
            let _ = self
                .incoming
                .send(FsmEvent::StateChange(next_state))
                .await;
        }
        self.fsm
    }

    fn killed(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run_idle(&mut self) -> Option<SessionState> {
        self.fsm.protocol = None;
        let wait = sleep(Duration::from_secs(self.fsm.idle_hold_time));
        tokio::pin!(wait);
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.killed() {
                        return None;
                    }
                }
                _ = &mut wait, if !self.fsm.admin_down => {
                    // The post-reset idle hold only applies once
                    self.fsm.idle_hold_time = DEFAULT_IDLE_HOLD_TIME;
                    return Some(SessionState::Active);
                }
                conn = self.fsm.conn_rx.recv() => match conn {
                    // Connections are refused until the FSM starts up again
                    Some(stream) => drop(stream),
                    None => return None,
                },
                admin = self.fsm.admin_rx.recv() => match admin {
                    Some(state) => {
                        self.fsm.admin_down = state == AdminState::Down;
                        if state == AdminState::Up {
                            wait.as_mut().reset(
                                Instant::now() + Duration::from_secs(self.fsm.idle_hold_time),
                            );
                        }
                    }
                    None => return None,
                },
                msg = self.outgoing.recv() => {
                    // Not established: anything queued is dropped
                    if msg.is_none() {
                        return None;
                    }
                }
            }
        }
    }

    async fn run_active(&mut self) -> Option<SessionState> {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.killed() {
                        return None;
                    }
                }
                conn = self.fsm.conn_rx.recv() => match conn {
                    Some(stream) => {
                        self.fsm.attach(stream);
                        let open = self.fsm.create_open();
                        if let Some(protocol) = self.fsm.protocol.as_mut() {
                            if let Err(err) = write_message(
                                protocol,
                                &self.incoming,
                                self.fsm.config.remote_ip,
                                Message::Open(open),
                            )
                            .await
                            {
                                warn!(
                                    "[{}] Error sending OPEN: {}",
                                    self.fsm.config.remote_ip, err
                                );
                                self.fsm.protocol = None;
                                return Some(SessionState::Idle);
                            }
                        }
                        return Some(SessionState::OpenSent);
                    }
                    None => return None,
                },
                admin = self.fsm.admin_rx.recv() => match admin {
                    Some(AdminState::Down) => {
                        self.fsm.admin_down = true;
                        return Some(SessionState::Idle);
                    }
                    Some(AdminState::Up) => {}
                    None => return None,
                },
                msg = self.outgoing.recv() => {
                    if msg.is_none() {
                        return None;
                    }
                }
            }
        }
    }

    async fn run_open_sent(&mut self) -> Option<SessionState> {
        let addr = self.fsm.config.remote_ip;
        let mut protocol = match self.fsm.protocol.take() {
            Some(protocol) => protocol,
            None => return Some(SessionState::Idle),
        };
        let mut hold_timer = HoldTimer::new(self.fsm.config.hold_timer);
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.killed() {
                        return None;
                    }
                }
                message = protocol.next() => match message {
                    Some(Ok(Message::Open(open))) => {
                        hold_timer.received();
                        let remote_asn = asn_from_open(&open);
                        if remote_asn != self.fsm.config.remote_as {
                            warn!(
                                "[{}] OPEN ASN mismatch (received={}, expected={})",
                                addr, remote_asn, self.fsm.config.remote_as
                            );
                            let _ = write_message(
                                &mut protocol,
                                &self.incoming,
                                addr,
                                notification(BGP_ERR_OPEN, 2),
                            )
                            .await;
                            return Some(SessionState::Idle);
                        }
                        self.fsm.hold_time =
                            negotiated_hold_time(self.fsm.config.hold_timer, open.hold_timer);
                        self.fsm.remote_router_id = Some(open.identifier);
                        let _ = self
                            .incoming
                            .send(FsmEvent::Message(Message::Open(open)))
                            .await;
                        if let Err(err) =
                            write_message(&mut protocol, &self.incoming, addr, Message::KeepAlive)
                                .await
                        {
                            warn!("[{}] Error sending KEEPALIVE: {}", addr, err);
                            return Some(SessionState::Idle);
                        }
                        hold_timer.sent();
                        self.fsm.protocol = Some(protocol);
                        return Some(SessionState::OpenConfirm);
                    }
                    Some(Ok(Message::Notification(notification))) => {
                        warn!("[{}] NOTIFICATION: {}", addr, notification.to_string());
                        let _ = self
                            .incoming
                            .send(FsmEvent::Message(Message::Notification(notification)))
                            .await;
                        return Some(SessionState::Idle);
                    }
                    Some(Ok(message)) => {
                        warn!(
                            "[{}] Unexpected {} while waiting for OPEN",
                            addr,
                            get_message_type(&message)
                        );
                        let _ = write_message(
                            &mut protocol,
                            &self.incoming,
                            addr,
                            notification(BGP_ERR_FSM, self.fsm.state.fsm_subcode()),
                        )
                        .await;
                        return Some(SessionState::Idle);
                    }
                    Some(Err(CodecError::Message(err))) => {
                        let _ = self.incoming.send(FsmEvent::MessageError(err)).await;
                    }
                    Some(Err(CodecError::Io(err))) => {
                        warn!("[{}] Transport error: {}", addr, err);
                        return Some(SessionState::Idle);
                    }
                    None => return Some(SessionState::Idle),
                },
                conn = self.fsm.conn_rx.recv() => match conn {
                    Some(stream) => {
                        if self.fsm.keep_current_connection() {
                            debug!("[{}] Collision: keeping current connection", addr);
                            drop(stream);
                        } else {
                            debug!("[{}] Collision: switching to offered connection", addr);
                            self.fsm.attach(stream);
                            protocol = match self.fsm.protocol.take() {
                                Some(protocol) => protocol,
                                None => return Some(SessionState::Idle),
                            };
                            let open = self.fsm.create_open();
                            if write_message(
                                &mut protocol,
                                &self.incoming,
                                addr,
                                Message::Open(open),
                            )
                            .await
                            .is_err()
                            {
                                return Some(SessionState::Idle);
                            }
                            hold_timer.sent();
                        }
                    }
                    None => return None,
                },
                admin = self.fsm.admin_rx.recv() => match admin {
                    Some(AdminState::Down) => {
                        self.fsm.admin_down = true;
                        return Some(SessionState::Idle);
                    }
                    Some(AdminState::Up) => {}
                    None => return None,
                },
                event = hold_timer.poll() => {
                    // Expiry only; keepalives start after OPENs cross
                    if event == HoldEvent::Expired {
                        let _ = write_message(
                            &mut protocol,
                            &self.incoming,
                            addr,
                            notification(BGP_ERR_HOLD_TIMER_EXPIRED, 0),
                        )
                        .await;
                        return Some(SessionState::Idle);
                    }
                }
                msg = self.outgoing.recv() => {
                    if msg.is_none() {
                        return None;
                    }
                }
            }
        }
    }

    async fn run_open_confirm(&mut self) -> Option<SessionState> {
        let addr = self.fsm.config.remote_ip;
        let mut protocol = match self.fsm.protocol.take() {
            Some(protocol) => protocol,
            None => return Some(SessionState::Idle),
        };
        let mut hold_timer = HoldTimer::new(self.fsm.hold_time);
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.killed() {
                        return None;
                    }
                }
                message = protocol.next() => match message {
                    Some(Ok(Message::KeepAlive)) => {
                        hold_timer.received();
                        let _ = self
                            .incoming
                            .send(FsmEvent::Message(Message::KeepAlive))
                            .await;
                        self.fsm.protocol = Some(protocol);
                        return Some(SessionState::Established);
                    }
                    Some(Ok(Message::Notification(notification))) => {
                        warn!("[{}] NOTIFICATION: {}", addr, notification.to_string());
                        let _ = self
                            .incoming
                            .send(FsmEvent::Message(Message::Notification(notification)))
                            .await;
                        return Some(SessionState::Idle);
                    }
                    Some(Ok(message)) => {
                        warn!(
                            "[{}] Unexpected {} while waiting for KEEPALIVE",
                            addr,
                            get_message_type(&message)
                        );
                        let _ = write_message(
                            &mut protocol,
                            &self.incoming,
                            addr,
                            notification(BGP_ERR_FSM, self.fsm.state.fsm_subcode()),
                        )
                        .await;
                        return Some(SessionState::Idle);
                    }
                    Some(Err(CodecError::Message(err))) => {
                        let _ = self.incoming.send(FsmEvent::MessageError(err)).await;
                    }
                    Some(Err(CodecError::Io(err))) => {
                        warn!("[{}] Transport error: {}", addr, err);
                        return Some(SessionState::Idle);
                    }
                    None => return Some(SessionState::Idle),
                },
                conn = self.fsm.conn_rx.recv() => match conn {
                    Some(stream) => {
                        if self.fsm.keep_current_connection() {
                            debug!("[{}] Collision: keeping current connection", addr);
                            drop(stream);
                        } else {
                            debug!("[{}] Collision: restarting on offered connection", addr);
                            self.fsm.attach(stream);
                            return Some(SessionState::OpenSent);
                        }
                    }
                    None => return None,
                },
                admin = self.fsm.admin_rx.recv() => match admin {
                    Some(AdminState::Down) => {
                        self.fsm.admin_down = true;
                        return Some(SessionState::Idle);
                    }
                    Some(AdminState::Up) => {}
                    None => return None,
                },
                event = hold_timer.poll() => match event {
                    HoldEvent::SendKeepalive => {
                        if write_message(&mut protocol, &self.incoming, addr, Message::KeepAlive)
                            .await
                            .is_err()
                        {
                            return Some(SessionState::Idle);
                        }
                        hold_timer.sent();
                    }
                    HoldEvent::Wait => {}
                    HoldEvent::Expired => {
                        let _ = write_message(
                            &mut protocol,
                            &self.incoming,
                            addr,
                            notification(BGP_ERR_HOLD_TIMER_EXPIRED, 0),
                        )
                        .await;
                        return Some(SessionState::Idle);
                    }
                },
                msg = self.outgoing.recv() => {
                    if msg.is_none() {
                        return None;
                    }
                }
            }
        }
    }

    async fn run_established(&mut self) -> Option<SessionState> {
        let addr = self.fsm.config.remote_ip;
        let mut protocol = match self.fsm.protocol.take() {
            Some(protocol) => protocol,
            None => return Some(SessionState::Idle),
        };
        let mut hold_timer = HoldTimer::new(self.fsm.hold_time);
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.killed() {
                        // Flush what the supervisor already queued (the
                        // CEASE goes out best effort), then wind down
                        while let Ok(message) = self.outgoing.try_recv() {
                            if write_message(&mut protocol, &self.incoming, addr, message)
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        return None;
                    }
                }
                msg = self.outgoing.recv() => match msg {
                    Some(message) => {
                        if let Err(err) =
                            write_message(&mut protocol, &self.incoming, addr, message).await
                        {
                            warn!("[{}] Transport error: {}", addr, err);
                            return Some(SessionState::Idle);
                        }
                        hold_timer.sent();
                    }
                    None => return None,
                },
                message = protocol.next() => match message {
                    Some(Ok(Message::Open(_))) => {
                        let _ = write_message(
                            &mut protocol,
                            &self.incoming,
                            addr,
                            notification(BGP_ERR_FSM, self.fsm.state.fsm_subcode()),
                        )
                        .await;
                        return Some(SessionState::Idle);
                    }
                    Some(Ok(Message::Notification(notif))) => {
                        hold_timer.received();
                        let _ = self
                            .incoming
                            .send(FsmEvent::Message(Message::Notification(notif)))
                            .await;
                        return Some(SessionState::Idle);
                    }
                    Some(Ok(message)) => {
                        trace!("[{}] Incoming: {}", addr, get_message_type(&message));
                        hold_timer.received();
                        let _ = self.incoming.send(FsmEvent::Message(message)).await;
                    }
                    Some(Err(CodecError::Message(err))) => {
                        // One bad PDU; the session continues
                        let _ = self.incoming.send(FsmEvent::MessageError(err)).await;
                    }
                    Some(Err(CodecError::Io(err))) => {
                        warn!("[{}] Transport error: {}", addr, err);
                        return Some(SessionState::Idle);
                    }
                    None => {
                        warn!("[{}] Connection closed by peer", addr);
                        return Some(SessionState::Idle);
                    }
                },
                conn = self.fsm.conn_rx.recv() => match conn {
                    // An established session always wins a collision
                    Some(stream) => drop(stream),
                    None => return None,
                },
                admin = self.fsm.admin_rx.recv() => match admin {
                    Some(AdminState::Down) => {
                        self.fsm.admin_down = true;
                        return Some(SessionState::Idle);
                    }
                    Some(AdminState::Up) => {}
                    None => return None,
                },
                event = hold_timer.poll() => match event {
                    HoldEvent::SendKeepalive => {
                        if write_message(&mut protocol, &self.incoming, addr, Message::KeepAlive)
                            .await
                            .is_err()
                        {
                            return Some(SessionState::Idle);
                        }
                        hold_timer.sent();
                    }
                    HoldEvent::Wait => {}
                    HoldEvent::Expired => {
                        let _ = write_message(
                            &mut protocol,
                            &self.incoming,
                            addr,
                            notification(BGP_ERR_HOLD_TIMER_EXPIRED, 0),
                        )
                        .await;
                        return Some(SessionState::Idle);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyAction;

    fn test_config(local_router_id: &str) -> Arc<PeerConfig> {
        test_config_with_as(local_router_id, 65000)
    }

    fn test_config_with_as(local_router_id: &str, local_as: u32) -> Arc<PeerConfig> {
        Arc::new(PeerConfig {
            remote_ip: "192.0.2.1".parse().unwrap(),
            remote_as: 65001,
            local_as,
            local_router_id: local_router_id.parse().unwrap(),
            local_addr: None,
            enabled: true,
            passive: false,
            hold_timer: 90,
            connect_retry: 30,
            idle_hold_time_after_reset: 30,
            dest_port: 179,
            route_server_client: false,
            families: vec![],
            import_policy: vec![],
            export_policy: vec![],
            default_import: PolicyAction::Accept,
            default_export: PolicyAction::Accept,
            static_routes: vec![],
        })
    }

    #[test]
    fn test_negotiated_hold_time() {
        assert_eq!(negotiated_hold_time(90, 180), 90);
        assert_eq!(negotiated_hold_time(180, 30), 30);
        assert_eq!(negotiated_hold_time(180, 0), 0);
    }

    #[test]
    fn test_fsm_error_subcodes_name_the_state() {
        assert_eq!(SessionState::OpenSent.fsm_subcode(), 1);
        assert_eq!(SessionState::OpenConfirm.fsm_subcode(), 2);
        assert_eq!(SessionState::Established.fsm_subcode(), 3);
        assert_eq!(SessionState::Idle.fsm_subcode(), 0);
        assert_eq!(SessionState::Active.fsm_subcode(), 0);
    }

    #[test]
    fn test_create_open_uses_as_trans_for_wide_asn() {
        let (_, conn_rx) = mpsc::channel(1);
        let (_, admin_rx) = mpsc::channel(1);
        let fsm = Fsm::new(test_config_with_as("1.1.1.1", 4259840100), conn_rx, admin_rx);
        let open = fsm.create_open();
        assert_eq!(u32::from(open.peer_asn), AS_TRANS);
        assert!(open.parameters.iter().any(|p| matches!(
            p,
            OpenParameter::Capabilities(caps)
                if caps.iter().any(|c| matches!(c, OpenCapability::FourByteASN(4259840100)))
        )));
    }

    #[test]
    fn test_collision_rules() {
        let (_, conn_rx) = mpsc::channel(1);
        let (_, admin_rx) = mpsc::channel(1);
        let mut fsm = Fsm::new(test_config("9.9.9.9"), conn_rx, admin_rx);

        // Remote OPEN not seen yet: the accepted connection wins
        fsm.outbound = true;
        assert!(!fsm.keep_current_connection());
        fsm.outbound = false;
        assert!(fsm.keep_current_connection());

        // Higher local identifier keeps its own dial
        fsm.outbound = true;
        fsm.remote_router_id = Some(router_id_u32("2.2.2.2".parse().unwrap()));
        assert!(fsm.keep_current_connection());

        // Lower local identifier defers to the remote's dial
        let (_, conn_rx) = mpsc::channel(1);
        let (_, admin_rx) = mpsc::channel(1);
        let mut fsm = Fsm::new(test_config("1.1.1.1"), conn_rx, admin_rx);
        fsm.outbound = true;
        fsm.remote_router_id = Some(router_id_u32("2.2.2.2".parse().unwrap()));
        assert!(!fsm.keep_current_connection());
    }
}
