use std::io::Result;

use env_logger::Builder;
use log::{debug, info, LevelFilter};

fn init_logging(verbose: u8) {
    let (bgpsd_level, other_level) = match verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("bgpsd"), bgpsd_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", bgpsd_level, other_level);
}

fn run_daemon(config_path: &str, address: std::net::IpAddr, port: u16) -> Result<()> {
    let config = bgpsd::config::from_file(config_path)?;
    debug!("Found {} peers in {}", config.peers.len(), config_path);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(bgpsd::server::serve(address, port, config))
}

#[cfg(feature = "cli")]
fn main() -> Result<()> {
    use clap::Parser;

    let args = bgpsd::cli::Args::parse();
    match &args.cmd {
        bgpsd::cli::Command::Run(options) => {
            init_logging(args.verbose);
            run_daemon(&options.config_path, options.address, options.listen_port)
        }
        _ => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(bgpsd::cli::query_bgpsd(&args));
            Ok(())
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() -> Result<()> {
    use clap::Parser;

    #[derive(Parser, Debug)]
    #[clap(name = "bgpsd", rename_all = "kebab-case")]
    /// BGP speaker daemon
    struct Args {
        /// Path to the bgpsd config.toml
        config_path: String,
        /// IP Address to listen on
        #[clap(short, long, default_value = "127.0.0.1")]
        address: std::net::IpAddr,
        /// TCP port to listen on
        #[clap(long, default_value_t = 179)]
        listen_port: u16,
        /// Sets the level of logging verbosity
        #[clap(short, parse(from_occurrences))]
        verbose: u8,
    }

    let args = Args::parse();
    init_logging(args.verbose);
    run_daemon(&args.config_path, args.address, args.listen_port)
}
