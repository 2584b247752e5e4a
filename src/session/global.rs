use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, Mutex};

use super::messages::{ApiRequest, ApiRequestKind, ApiResponse, PeerMsg, ServerMsg};
use super::FSM_CHANNEL_LENGTH;
use crate::api::RouteSnapshot;
use crate::rib::{Path, PeerInfo, Rib};

/// Handles for talking to the global pseudo-session
#[derive(Clone, Debug)]
pub struct GlobalHandle {
    pub server_tx: mpsc::Sender<ServerMsg>,
    pub peer_tx: mpsc::Sender<PeerMsg>,
    pub kill_tx: mpsc::Sender<()>,
}

/// The speaker-wide RIB as an actor.
///
/// Shares the route pipeline with peer sessions but has no FSM and no
/// connect loop: it ingests PATH traffic from non-route-server peers,
/// runs the decision process, and broadcasts the outcome back to them.
pub struct GlobalSession {
    info: PeerInfo,
    rib: Arc<Mutex<Rib>>,
    siblings: HashMap<IpAddr, mpsc::Sender<PeerMsg>>,
    server_rx: mpsc::Receiver<ServerMsg>,
    peer_rx: mpsc::Receiver<PeerMsg>,
    kill_rx: mpsc::Receiver<()>,
}

impl GlobalSession {
    pub fn new(local_as: u32, router_id: IpAddr, rib: Arc<Mutex<Rib>>) -> (Self, GlobalHandle) {
        let (server_tx, server_rx) = mpsc::channel(FSM_CHANNEL_LENGTH);
        let (peer_tx, peer_rx) = mpsc::channel(FSM_CHANNEL_LENGTH);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let session = GlobalSession {
            info: PeerInfo::new(local_as, router_id, router_id),
            rib,
            siblings: HashMap::new(),
            server_rx,
            peer_rx,
            kill_rx,
        };
        let handle = GlobalHandle {
            server_tx,
            peer_tx,
            kill_tx,
        };
        (session, handle)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                kill = self.kill_rx.recv() => {
                    let _ = kill;
                    info!("Global RIB session stopped");
                    return;
                }
                msg = self.peer_rx.recv() => match msg {
                    Some(msg) => self.handle_peer_msg(msg).await,
                    None => return,
                },
                msg = self.server_rx.recv() => match msg {
                    Some(msg) => self.handle_server_msg(msg).await,
                    None => return,
                },
            }
        }
    }

    async fn broadcast(&self, msg: PeerMsg) {
        for (addr, mailbox) in &self.siblings {
            if mailbox.send(msg.clone()).await.is_err() {
                debug!("[global] Sibling {} mailbox closed", addr);
            }
        }
    }

    async fn handle_peer_msg(&mut self, msg: PeerMsg) {
        match msg {
            PeerMsg::Paths(paths) => {
                let changes = self.rib.lock().await.process_paths(paths);
                if !changes.is_empty() {
                    self.broadcast(PeerMsg::Paths(changes)).await;
                }
            }
            PeerMsg::PeerDown(info) => {
                debug!("[global] Peer down: {}", info);
                let changes = {
                    let mut rib = self.rib.lock().await;
                    rib.families()
                        .into_iter()
                        .flat_map(|family| rib.delete_paths_for_peer(&info, family))
                        .collect::<Vec<Path>>()
                };
                if !changes.is_empty() {
                    self.broadcast(PeerMsg::Paths(changes)).await;
                }
            }
        }
    }

    async fn handle_server_msg(&mut self, msg: ServerMsg) {
        match msg {
            ServerMsg::PeerAdded { addr, mailbox } => {
                debug!("[global] Sibling {} registered", addr);
                self.siblings.insert(addr, mailbox.clone());
                // The newcomer starts from the current table contents
                let paths: Vec<Path> = {
                    let rib = self.rib.lock().await;
                    rib.tables().into_iter().flat_map(|(_, paths)| paths).collect()
                };
                if !paths.is_empty() && mailbox.send(PeerMsg::Paths(paths)).await.is_err() {
                    debug!("[global] Sibling {} mailbox closed", addr);
                }
            }
            ServerMsg::PeerDeleted { addr, info } => {
                debug!("[global] Sibling {} removed", addr);
                self.siblings.remove(&addr);
                let changes = {
                    let mut rib = self.rib.lock().await;
                    rib.families()
                        .into_iter()
                        .flat_map(|family| rib.delete_paths_for_peer(&info, family))
                        .collect::<Vec<Path>>()
                };
                if !changes.is_empty() {
                    self.broadcast(PeerMsg::Paths(changes)).await;
                }
            }
            // The global table carries no policies of its own
            ServerMsg::PolicyUpdated(_) => {}
            ServerMsg::Api(request) => self.handle_api_request(request).await,
        }
    }

    async fn handle_api_request(&mut self, request: ApiRequest) {
        let response = match request.kind {
            ApiRequestKind::Rib(family) => {
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
            _ => ApiResponse::Error("not a global-RIB operation".to_string()),
        };
        let _ = request.reply.send(response);
    }

    /// Identity used when locally originated paths enter the table
    pub fn peer_info(&self) -> PeerInfo {
        self.info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rib::{Families, Family, PathAttributes};
    use crate::utils::prefix_from_str;
    use bgp_rs::{NLRIEncoding, AFI, SAFI};

    fn family() -> Family {
        Family::new(AFI::IPV4, SAFI::Unicast)
    }

    fn new_global() -> (GlobalSession, GlobalHandle) {
        let rib = Arc::new(Mutex::new(Rib::new(&Families::new(vec![family()]))));
        GlobalSession::new(65000, "1.1.1.1".parse().unwrap(), rib)
    }

    fn test_path(prefix: &str, peer_addr: &str) -> Path {
        let source = PeerInfo::new(65001, "2.2.2.2".parse().unwrap(), peer_addr.parse().unwrap());
        let mut attributes = PathAttributes::default();
        attributes.next_hop = Some(source.address);
        Path::new(
            family(),
            NLRIEncoding::IP(prefix_from_str(prefix).unwrap()),
            Arc::new(attributes),
            source,
            false,
        )
    }

    #[tokio::test]
    async fn paths_run_decision_process_and_rebroadcast() {
        let (mut global, _handle) = new_global();
        let (sib_tx, mut sib_rx) = mpsc::channel(16);
        global.siblings.insert("192.0.2.9".parse().unwrap(), sib_tx);

        global
            .handle_peer_msg(PeerMsg::Paths(vec![test_path("10.1.0.0/16", "192.0.2.1")]))
            .await;
        match sib_rx.try_recv() {
            Ok(PeerMsg::Paths(paths)) => assert_eq!(paths.len(), 1),
            other => panic!("Expected best-path broadcast, got {:?}", other),
        }
        assert_eq!(global.rib.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn peer_down_withdraws_from_table() {
        let (mut global, _handle) = new_global();
        let (sib_tx, mut sib_rx) = mpsc::channel(16);
        global.siblings.insert("192.0.2.9".parse().unwrap(), sib_tx);

        let path = test_path("10.1.0.0/16", "192.0.2.1");
        let source = path.source.clone();
        global.handle_peer_msg(PeerMsg::Paths(vec![path])).await;
        let _ = sib_rx.try_recv();

        global.handle_peer_msg(PeerMsg::PeerDown(source)).await;
        match sib_rx.try_recv() {
            Ok(PeerMsg::Paths(paths)) => {
                assert_eq!(paths.len(), 1);
                assert!(paths[0].is_withdraw);
            }
            other => panic!("Expected withdrawal broadcast, got {:?}", other),
        }
        assert!(global.rib.lock().await.is_empty());
    }

    #[tokio::test]
    async fn new_sibling_receives_baseline() {
        let (mut global, _handle) = new_global();
        global
            .handle_peer_msg(PeerMsg::Paths(vec![test_path("10.1.0.0/16", "192.0.2.1")]))
            .await;

        let (sib_tx, mut sib_rx) = mpsc::channel(16);
        global
            .handle_server_msg(ServerMsg::PeerAdded {
                addr: "192.0.2.9".parse().unwrap(),
                mailbox: sib_tx,
            })
            .await;
        match sib_rx.try_recv() {
            Ok(PeerMsg::Paths(paths)) => assert_eq!(paths.len(), 1),
            other => panic!("Expected baseline, got {:?}", other),
        }
    }
}
