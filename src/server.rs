use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use jsonrpsee::http_server::HttpServerBuilder;
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::api::{ApiHandler, ApiServer};
use crate::config::ServerConfig;
use crate::rib::{Families, Family, Path, PathAttributes, Rib};
use crate::session::{
    GlobalSession, PeerMsg, PeerSession, ServerMsg, SessionHandle,
};

fn to_io_error<E: std::fmt::Display>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

/// Bring up every configured session actor, wire the sibling mesh, and
/// serve until interrupted.
pub async fn serve(addr: IpAddr, port: u16, config: ServerConfig) -> io::Result<()> {
    let policies = config.policies;

    // The global table spans every family any neighbor carries
    let all_families: Vec<Family> = config
        .peers
        .iter()
        .flat_map(|peer| peer.families.clone())
        .collect();
    let global_rib = Arc::new(Mutex::new(Rib::new(&Families::new(all_families))));
    let (global_session, global_handle) =
        GlobalSession::new(config.local_as, config.router_id, global_rib.clone());
    let local_info = global_session.peer_info();

    let mut handles: HashMap<IpAddr, SessionHandle> = HashMap::with_capacity(config.peers.len());
    let mut joins = Vec::with_capacity(config.peers.len() + 1);
    for peer_config in &config.peers {
        let rib = if peer_config.route_server_client {
            // Route-server clients get a decision table of their own
            Arc::new(Mutex::new(Rib::new(&Families::from(
                &peer_config.families[..],
            ))))
        } else {
            global_rib.clone()
        };
        let (session, handle) = PeerSession::new(peer_config.clone(), rib, &policies);
        joins.push(tokio::spawn(session.run()));
        handles.insert(handle.addr, handle);
        info!("Added neighbor {}", peer_config.remote_ip);
    }
    joins.push(tokio::spawn(global_session.run()));

    // Sibling wiring: route-server clients fan out to each other; every
    // other neighbor exchanges routes through the global pseudo-session
    for peer_config in &config.peers {
        let handle = &handles[&peer_config.remote_ip];
        if peer_config.route_server_client {
            for other in &config.peers {
                if !other.route_server_client || other.remote_ip == peer_config.remote_ip {
                    continue;
                }
                let mailbox = handles[&other.remote_ip].peer_tx.clone();
                handle
                    .server_tx
                    .send(ServerMsg::PeerAdded {
                        addr: other.remote_ip,
                        mailbox,
                    })
                    .await
                    .map_err(to_io_error)?;
            }
        } else {
            handle
                .server_tx
                .send(ServerMsg::PeerAdded {
                    addr: config.router_id,
                    mailbox: global_handle.peer_tx.clone(),
                })
                .await
                .map_err(to_io_error)?;
            global_handle
                .server_tx
                .send(ServerMsg::PeerAdded {
                    addr: peer_config.remote_ip,
                    mailbox: handle.peer_tx.clone(),
                })
                .await
                .map_err(to_io_error)?;
        }
    }

    // Locally originated routes enter each neighbor's pipeline like any
    // other path list and surface once the session establishes
    for peer_config in &config.peers {
        if peer_config.static_routes.is_empty() {
            continue;
        }
        let mut paths: Vec<Path> = Vec::with_capacity(peer_config.static_routes.len());
        for spec in &peer_config.static_routes {
            let (family, attributes, nlri) = spec.parse()?;
            paths.push(Path::new(
                family,
                nlri,
                Arc::new(PathAttributes::from_attributes(&attributes)),
                local_info.clone(),
                false,
            ));
        }
        debug!(
            "Queueing {} static route(s) for {}",
            paths.len(),
            peer_config.remote_ip
        );
        handles[&peer_config.remote_ip]
            .peer_tx
            .send(PeerMsg::Paths(paths))
            .await
            .map_err(to_io_error)?;
    }

    // Incoming connections are routed to the owning session's offer
    // channel; the FSM resolves simultaneous connects
    let listener = TcpListener::bind(SocketAddr::new(addr, port)).await?;
    info!("Starting BGP server on {}:{}...", addr, port);
    let conn_channels: HashMap<IpAddr, mpsc::Sender<TcpStream>> = handles
        .iter()
        .map(|(addr, handle)| (*addr, handle.conn_tx.clone()))
        .collect();
    let listener_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, socket)) => match conn_channels.get(&socket.ip()) {
                    Some(conn_tx) => {
                        debug!("Incoming new connection from {}", socket.ip());
                        if conn_tx.try_send(stream).is_err() {
                            warn!("Connection offer channel for {} is full", socket.ip());
                        }
                    }
                    None => {
                        warn!(
                            "Unexpected connection from {}: Not a configured peer",
                            socket.ip()
                        );
                    }
                },
                Err(err) => warn!("Incoming connection failed: {}", err),
            }
        }
    });

    let api = ApiHandler::new(handles.clone(), global_handle.clone());
    let api_server = HttpServerBuilder::default()
        .build(config.api_addr)
        .await
        .map_err(to_io_error)?;
    let _api_handle = api_server.start(api.into_rpc()).map_err(to_io_error)?;
    info!("API listening on {}", config.api_addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down sessions");
    for handle in handles.values() {
        let _ = handle.kill_tx.send(()).await;
    }
    let _ = global_handle.kill_tx.send(()).await;
    for join in joins {
        let _ = join.await;
    }
    listener_task.abort();
    Ok(())
}
