//! # bgpsd CLI
//!
//! The same binary that runs the daemon also queries a running instance
//! over its JSON-RPC API (default endpoint localhost:8080; use `--host`
//! and `--port` to point elsewhere).
//!
//! ```sh
//! $ bgpsd show neighbors
//! $ bgpsd show neighbors detail
//! $ bgpsd show rib --family "ipv4 unicast"
//! $ bgpsd show routes learned --peer 127.0.0.2
//! $ bgpsd neighbor 127.0.0.2 disable
//! ```

use std::error::Error;
use std::net::IpAddr;

use clap::Parser;
use colored::*;
use itertools::Itertools;
use jsonrpsee::http_client::HttpClientBuilder;

use crate::api::ApiClient;

mod display;

use display::{neighbor_detail, neighbor_table, route_table};

#[derive(Parser, Debug)]
#[clap(name = "bgpsd", rename_all = "kebab-case")]
/// BGP speaker and the CLI to interact with it
pub struct Args {
    #[clap(subcommand)]
    pub cmd: Command,
    #[clap(long, default_value = "127.0.0.1", global = true)]
    pub host: String,
    #[clap(short, long, default_value_t = 8080, global = true)]
    pub port: u16,
    /// Show debug logs (additive for trace logs)
    #[clap(short, parse(from_occurrences), global = true)]
    pub verbose: u8,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum Command {
    /// Run the bgpsd daemon
    Run(RunOptions),
    /// View details about a running bgpsd
    #[clap(alias = "s", subcommand)]
    Show(Show),
    /// Operate on one neighbor session
    #[clap(subcommand)]
    Neighbor(NeighborCmd),
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct RunOptions {
    /// Path to the bgpsd config.toml
    pub config_path: String,
    /// IP Address to listen on
    #[clap(short, long, default_value = "127.0.0.1")]
    pub address: IpAddr,
    /// TCP port to listen on
    #[clap(long, default_value_t = 179)]
    pub listen_port: u16,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum Show {
    /// View configured neighbors and session details
    #[clap(alias = "n", visible_alias = "peers")]
    Neighbors(NeighborOptions),
    /// View a decision-process table (global, or one route-server client's)
    Rib(RibOptions),
    /// View per-neighbor adjacency tables
    #[clap(alias = "r", subcommand)]
    Routes(Routes),
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct NeighborOptions {
    /// IP Address to filter for one peer
    pub peer: Option<IpAddr>,
    #[clap(subcommand)]
    options: Option<ShowOptions>,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum ShowOptions {
    /// Show expanded details
    #[clap(alias = "d")]
    Detail,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct RibOptions {
    /// Route family, e.g. "ipv4 unicast"
    #[clap(short, long, default_value = "ipv4 unicast")]
    family: String,
    /// A route-server client whose table should be shown
    #[clap(long)]
    peer: Option<IpAddr>,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum Routes {
    /// Adj-RIB-In contents
    Learned(RouteOptions),
    /// Adj-RIB-Out contents
    Advertised(RouteOptions),
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct RouteOptions {
    /// Route family, e.g. "ipv4 unicast"
    #[clap(short, long, default_value = "ipv4 unicast")]
    family: String,
    /// IP Address to filter for one peer
    #[clap(long)]
    peer: Option<IpAddr>,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum NeighborCmd {
    Enable(NeighborTarget),
    Disable(NeighborTarget),
    /// Tear the session down with an administrative reset
    Reset(NeighborTarget),
    /// Send CEASE/administrative-shutdown
    Shutdown(NeighborTarget),
    /// Re-run route exchange without tearing the session down
    SoftReset(SoftResetOptions),
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct NeighborTarget {
    pub peer: IpAddr,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub struct SoftResetOptions {
    pub peer: IpAddr,
    /// "in" or "out"; both when omitted
    #[clap(short, long)]
    pub direction: Option<String>,
}

async fn run_cmd(args: &Args) -> Result<(), Box<dyn Error>> {
    let client = {
        let base = format!("http://{}:{}", args.host, args.port);
        HttpClientBuilder::default().build(base)?
    };
    match &args.cmd {
        Command::Show(show) => match show {
            Show::Neighbors(options) => {
                let mut neighbors = client.show_neighbors().await?;
                if let Some(peer) = options.peer {
                    neighbors.retain(|n| n.conf.remote_ip == peer);
                }
                if matches!(options.options, Some(ShowOptions::Detail)) {
                    for neighbor in &neighbors {
                        println!("{}\n", neighbor_detail(neighbor));
                    }
                } else {
                    neighbor_table(&neighbors).printstd();
                }
            }
            Show::Rib(options) => {
                let routes = client
                    .show_rib(options.family.clone(), options.peer)
                    .await?;
                println!("{}", options.family);
                route_table(&routes).printstd();
            }
            Show::Routes(routes) => {
                let mut found = match routes {
                    Routes::Learned(options) => {
                        client
                            .show_routes_learned(options.family.clone(), options.peer)
                            .await?
                    }
                    Routes::Advertised(options) => {
                        client
                            .show_routes_advertised(options.family.clone(), options.peer)
                            .await?
                    }
                };
                found.sort_by_key(|route| route.family.clone());
                for (family, routes) in &found.into_iter().group_by(|route| route.family.clone()) {
                    println!("{}", family);
                    route_table(&routes.collect::<Vec<_>>()).printstd();
                    println!();
                }
            }
        },
        Command::Neighbor(cmd) => {
            let outcome = match cmd {
                NeighborCmd::Enable(target) => client.neighbor_enable(target.peer).await,
                NeighborCmd::Disable(target) => client.neighbor_disable(target.peer).await,
                NeighborCmd::Reset(target) => client.neighbor_reset(target.peer).await,
                NeighborCmd::Shutdown(target) => client.neighbor_shutdown(target.peer).await,
                NeighborCmd::SoftReset(options) => {
                    client
                        .neighbor_soft_reset(options.peer, options.direction.clone())
                        .await
                }
            };
            match outcome {
                Ok(ack) => println!("{}", ack),
                Err(err) => eprintln!("Error: {}", err),
            }
        }
        // Run is handled by main before we get here
        Command::Run(_) => unreachable!("run is dispatched in main"),
    }
    Ok(())
}

/// bgpsd interactive commands (other than running the daemon)
pub async fn query_bgpsd(args: &Args) {
    if let Err(err) = run_cmd(args).await {
        eprintln!("{}", err.to_string().red());
    }
}
