//! TripStore server replica executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;
use tripstore::utils::tcp_bind_with_retry;
use tripstore::{
    logger_init, parsed_config, pf_error, pf_info, serve_api, serve_peer_rpcs,
    Node, ReplicaConfigPaxos, ReplicaConfigTwoPc, ReplicaId, TcpRegistry,
    TripStoreError,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// ID of this replica, an index into `peers`.
    #[arg(short, long)]
    id: ReplicaId,

    /// Peer listener addresses of all replicas, ordered by replica ID.
    #[arg(short, long, value_delimiter = ',', required = true)]
    peers: Vec<SocketAddr>,

    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Client-facing API port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52701)]
    api_port: u16,

    /// Paxos configuration parameters as a TOML string.
    #[arg(long)]
    paxos_config: Option<String>,

    /// Two-phase commit configuration parameters as a TOML string.
    #[arg(long)]
    twopc_config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 16)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(peer_port)` on success
    /// or `Err(TripStoreError)` on any error.
    fn sanitize(&self) -> Result<u16, TripStoreError> {
        if self.peers.is_empty() || self.peers.len() > u8::MAX as usize {
            Err(TripStoreError::msg(format!(
                "invalid population {}",
                self.peers.len()
            )))
        } else if self.id as usize >= self.peers.len() {
            Err(TripStoreError::msg(format!(
                "invalid replica id {} for population {}",
                self.id,
                self.peers.len()
            )))
        } else if self.api_port <= 1024 {
            Err(TripStoreError::msg(format!(
                "invalid api_port {}",
                self.api_port
            )))
        } else if self.threads < 2 {
            Err(TripStoreError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            let peer_port = self.peers[self.id as usize].port();
            if peer_port <= 1024 {
                Err(TripStoreError::msg(format!(
                    "invalid peer port {}",
                    peer_port
                )))
            } else if peer_port == self.api_port {
                Err(TripStoreError::msg(format!(
                    "peer port == api_port {}",
                    peer_port
                )))
            } else {
                Ok(peer_port)
            }
        }
    }
}

/// Actual main function of TripStore server replica.
fn server_main() -> Result<(), TripStoreError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let peer_port = args.sanitize()?;
    let population = args.peers.len() as u8;

    let paxos_config = parsed_config!(args.paxos_config.as_deref() => ReplicaConfigPaxos;
                                      max_retries, phase_timeout_ms,
                                      fanout_workers, retry_backoff_ms,
                                      drop_rate)?;
    let mut twopc_config = parsed_config!(args.twopc_config.as_deref() => ReplicaConfigTwoPc;
                                          vote_timeout_ms, commit_ack_timeout_ms,
                                          conflict_wait_ms, txn_log_path,
                                          logger_sync, fanout_workers)?;
    if twopc_config.txn_log_path == ReplicaConfigTwoPc::default().txn_log_path
    {
        // keep replicas sharing a host from sharing one log file
        twopc_config.txn_log_path =
            ReplicaConfigTwoPc::default_for(args.id).txn_log_path;
    }

    let peer_addr = SocketAddr::from((args.bind_ip, peer_port));
    let api_addr = SocketAddr::from((args.bind_ip, args.api_port));

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("main"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-replica")
            .build()?;

        // enter tokio runtime, setup the node, and serve until terminated
        runtime.block_on(async move {
            let node = Node::new_and_setup(
                args.id,
                population,
                paxos_config,
                twopc_config,
            )
            .await?;

            let peer_listener =
                tcp_bind_with_retry(peer_addr, 10).await?;
            let api_listener =
                tcp_bind_with_retry(api_addr, 10).await?;

            let registry = TcpRegistry::new(&args.peers);
            node.connect_with_all_servers(population, &registry)?;

            let mut peer_task =
                tokio::spawn(serve_peer_rpcs(peer_listener, node.clone()));
            let mut api_task =
                tokio::spawn(serve_api(api_listener, node.clone()));
            pf_info!(args.id; "replica up: peers {} api {}", peer_addr, api_addr);

            let result = tokio::select! {
                res = &mut peer_task => res?,
                res = &mut api_task => res?,
                _ = rx_term.changed() => {
                    pf_info!(args.id; "termination signal received");
                    Ok(())
                }
            };
            peer_task.abort();
            api_task.abort();

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            result
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of TripStore server replica.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("main"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn valid_args() -> Result<CliArgs, TripStoreError> {
        Ok(CliArgs {
            id: 1,
            peers: vec![
                "127.0.0.1:52800".parse()?,
                "127.0.0.1:52801".parse()?,
                "127.0.0.1:52802".parse()?,
            ],
            bind_ip: "127.0.0.1".parse()?,
            api_port: 52901,
            paxos_config: None,
            twopc_config: None,
            threads: 2,
        })
    }

    #[test]
    fn sanitize_valid() -> Result<(), TripStoreError> {
        let args = valid_args()?;
        assert_eq!(args.sanitize(), Ok(52801));
        Ok(())
    }

    #[test]
    fn sanitize_invalid_id() -> Result<(), TripStoreError> {
        let mut args = valid_args()?;
        args.id = 3;
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_empty_peers() -> Result<(), TripStoreError> {
        let mut args = valid_args()?;
        args.peers.clear();
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_api_port() -> Result<(), TripStoreError> {
        let mut args = valid_args()?;
        args.api_port = 1023;
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_same_peer_api_port() -> Result<(), TripStoreError> {
        let mut args = valid_args()?;
        args.api_port = 52801;
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), TripStoreError> {
        let mut args = valid_args()?;
        args.threads = 1;
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn parse_paxos_config() -> Result<(), TripStoreError> {
        let config = parsed_config!(Some("max_retries = 3\ndrop_rate = 0.5") => ReplicaConfigPaxos;
                                    max_retries, drop_rate)?;
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.drop_rate, 0.5);
        assert!(parsed_config!(Some("bogus = 1") => ReplicaConfigPaxos;
                               max_retries)
        .is_err());
        Ok(())
    }
}
