use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use net2::TcpBuilder;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{interval, timeout, MissedTickBehavior};

use super::{SessionState, MIN_CONNECT_RETRY};
use crate::config::PeerConfig;

/// Cadence for outbound dial attempts, floored at MIN_CONNECT_RETRY
pub(super) fn retry_period(configured: u64) -> Duration {
    Duration::from_secs(configured.max(MIN_CONNECT_RETRY))
}

/// Dials out to idle peers while their session sits in Active.
///
/// The ticker starts stopped; the supervisor's "become active" token
/// starts it and also triggers an immediate attempt. Dials bind to the
/// neighbor's configured source address when one is set. Only runs for
/// non-passive peers.
pub struct ConnectLoop {
    config: Arc<PeerConfig>,
    state_rx: watch::Receiver<SessionState>,
    conn_tx: mpsc::Sender<TcpStream>,
    active_rx: mpsc::Receiver<()>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectLoop {
    pub fn spawn(
        config: Arc<PeerConfig>,
        state_rx: watch::Receiver<SessionState>,
        conn_tx: mpsc::Sender<TcpStream>,
        active_rx: mpsc::Receiver<()>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let connect_loop = ConnectLoop {
            config,
            state_rx,
            conn_tx,
            active_rx,
            shutdown,
        };
        tokio::spawn(connect_loop.run())
    }

    async fn run(mut self) {
        let mut ticker = interval(retry_period(self.config.connect_retry));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticking = false;
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return;
                    }
                }
                token = self.active_rx.recv() => match token {
                    Some(()) => {
                        ticking = true;
                        ticker.reset();
                        self.attempt().await;
                    }
                    None => return,
                },
                _ = ticker.tick(), if ticking => {
                    self.attempt().await;
                }
            }
        }
    }

    async fn attempt(&mut self) {
        if *self.state_rx.borrow() != SessionState::Active {
            return;
        }
        let peer_addr = SocketAddr::new(self.config.remote_ip, self.config.dest_port);
        match dial(peer_addr, self.config.local_addr).await {
            Ok(stream) => {
                debug!("Outbound connection to {} up", peer_addr);
                // A closed offer channel means the session is tearing down
                let _ = self.conn_tx.send(stream).await;
            }
            Err(err) => warn!("Error connecting to {}: {}", peer_addr, err),
        }
    }
}

async fn dial(peer_addr: SocketAddr, source: Option<IpAddr>) -> io::Result<TcpStream> {
    let connect = task::spawn_blocking(move || -> io::Result<std::net::TcpStream> {
        let builder = match peer_addr {
            SocketAddr::V4(_) => TcpBuilder::new_v4()?,
            SocketAddr::V6(_) => TcpBuilder::new_v6()?,
        };
        builder.reuse_address(true)?;
        if let Some(source) = source {
            builder.bind(SocketAddr::new(source, 0))?;
        }
        let stream = builder.connect(peer_addr)?;
        stream.set_nonblocking(true)?;
        Ok(stream)
    });
    let stream = timeout(Duration::from_secs(MIN_CONNECT_RETRY - 1), connect)
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("Timed out connecting to {}", peer_addr),
            )
        })?
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))??;
    TcpStream::from_std(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_period_floor() {
        assert_eq!(retry_period(0), Duration::from_secs(MIN_CONNECT_RETRY));
        assert_eq!(retry_period(3), Duration::from_secs(MIN_CONNECT_RETRY));
        assert_eq!(retry_period(120), Duration::from_secs(120));
    }
}
