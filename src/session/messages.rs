use std::net::IpAddr;
use std::sync::Arc;

use bgp_rs::Message;
use tokio::sync::{mpsc, oneshot};

use super::{MessageError, SessionState};
use crate::api::{NeighborSnapshot, RouteSnapshot};
use crate::policy::PolicyMap;
use crate::rib::{Family, Path, PeerInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Open,
    Update,
    Keepalive,
    Notification,
    RouteRefresh,
}

impl From<&Message> for MessageKind {
    fn from(message: &Message) -> Self {
        match message {
            Message::Open(_) => MessageKind::Open,
            Message::Update(_) => MessageKind::Update,
            Message::KeepAlive => MessageKind::Keepalive,
            Message::Notification(_) => MessageKind::Notification,
            Message::RouteRefresh(_) => MessageKind::RouteRefresh,
        }
    }
}

/// Events the FSM driver reports up to its supervisor
#[derive(Debug)]
pub enum FsmEvent {
    /// A decoded message from the wire
    Message(Message),
    /// A PDU that failed decoding; the supervisor answers coded errors
    /// with a NOTIFICATION
    MessageError(MessageError),
    /// A message went out on the wire
    Sent(MessageKind),
    /// The FSM moved to a new state; the handler task is winding down
    StateChange(SessionState),
}

/// Traffic between sibling sessions
#[derive(Clone, Debug)]
pub enum PeerMsg {
    /// Paths a sibling ingested (its post-receive Adj-RIB-In content)
    /// or computed for re-advertisement
    Paths(Vec<Path>),
    /// A sibling's session left ESTABLISHED
    PeerDown(PeerInfo),
}

/// Control traffic from the parent server
#[derive(Debug)]
pub enum ServerMsg {
    PeerAdded {
        addr: IpAddr,
        mailbox: mpsc::Sender<PeerMsg>,
    },
    PeerDeleted {
        addr: IpAddr,
        info: PeerInfo,
    },
    PolicyUpdated(Arc<PolicyMap>),
    Api(ApiRequest),
}

/// Administrative state tokens offered to the FSM driver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminState {
    Up,
    Down,
}

/// A management request plus the channel its answer goes out on
#[derive(Debug)]
pub struct ApiRequest {
    pub kind: ApiRequestKind,
    pub reply: oneshot::Sender<ApiResponse>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiRequestKind {
    Neighbor,
    Rib(Family),
    AdjRibIn(Family),
    AdjRibOut(Family),
    Shutdown,
    Reset,
    SoftReset,
    SoftResetIn,
    SoftResetOut,
    Enable,
    Disable,
}

#[derive(Debug)]
pub enum ApiResponse {
    Neighbor(Box<NeighborSnapshot>),
    Routes(Vec<RouteSnapshot>),
    Ack,
    Error(String),
}
