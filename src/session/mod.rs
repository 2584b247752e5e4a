mod codec;
mod connect;
mod counts;
mod fsm;
mod global;
mod hold_timer;
mod messages;
mod peer;

pub use codec::{CodecError, MessageCodec, MessageProtocol};
pub use connect::ConnectLoop;
pub use counts::{DirectionCounts, MessageCounters};
pub use fsm::{negotiated_hold_time, Fsm, FsmHandler};
pub use global::{GlobalHandle, GlobalSession};
pub use hold_timer::HoldTimer;
pub use messages::{
    AdminState, ApiRequest, ApiRequestKind, ApiResponse, FsmEvent, MessageKind, PeerMsg, ServerMsg,
};
pub use peer::{PeerSession, SessionHandle};

use std::error;
use std::fmt;

/// Capacity of every session mailbox and of the outgoing message channel
pub const FSM_CHANNEL_LENGTH: usize = 1024;

/// Floor for the outbound dial cadence, seconds
pub const MIN_CONNECT_RETRY: u64 = 10;

/// An ESTABLISHED session lost within this window counts as a flap
pub const FLOP_THRESHOLD_SECS: i64 = 30;

pub const BGP_ERR_MESSAGE_HEADER: u8 = 1;
pub const BGP_ERR_OPEN: u8 = 2;
pub const BGP_ERR_UPDATE: u8 = 3;
pub const BGP_ERR_HOLD_TIMER_EXPIRED: u8 = 4;
pub const BGP_ERR_FSM: u8 = 5;
pub const BGP_ERR_CEASE: u8 = 6;

pub const CEASE_ADMIN_SHUTDOWN: u8 = 2;
pub const CEASE_PEER_DECONFIGURED: u8 = 3;
pub const CEASE_ADMIN_RESET: u8 = 4;

pub const CAP_MULTIPROTOCOL: u8 = 1;
pub const CAP_ROUTE_REFRESH: u8 = 2;
pub const CAP_FOUR_OCTET_ASN: u8 = 65;

/// The six neighbor states of RFC 4271, in lifecycle order
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connect => "Connect",
            SessionState::Active => "Active",
            SessionState::OpenSent => "OpenSent",
            SessionState::OpenConfirm => "OpenConfirm",
            SessionState::Established => "Established",
        }
    }

    /// RFC 4271 6.6: the FSM-error NOTIFICATION subcode naming the state
    /// an unexpected message arrived in
    pub fn fsm_subcode(self) -> u8 {
        match self {
            SessionState::OpenSent => 1,
            SessionState::OpenConfirm => 2,
            SessionState::Established => 3,
            _ => 0,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A malformed PDU or a failed UPDATE validation.
///
/// `code`/`subcode` are the RFC 4271 notification values; a zero code
/// means "drop quietly, nothing to send".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageError {
    pub code: u8,
    pub subcode: u8,
    pub reason: String,
}

impl MessageError {
    pub fn new(code: u8, subcode: u8, reason: &str) -> Self {
        Self {
            code,
            subcode,
            reason: reason.to_string(),
        }
    }

    pub fn silent(reason: String) -> Self {
        Self {
            code: 0,
            subcode: 0,
            reason,
        }
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Message error [{}/{}]: {}",
            self.code, self.subcode, self.reason
        )
    }
}

impl error::Error for MessageError {}

/// What one poll of the hold timer asks the FSM driver to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldEvent {
    /// Nothing due yet
    Wait,
    /// Less than two keepalive intervals of hold time remain
    SendKeepalive,
    /// The peer went quiet for the whole negotiated hold time
    Expired,
}
