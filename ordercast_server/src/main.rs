//! Ordercast replica node executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{self, LevelFilter};
use ordercast::protocols::RotSeqReplica;
use ordercast::server::{MarketStore, StaticMembership};
use ordercast::{logger_init, pf_error, pf_warn, OrdercastError};
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::Duration;

mod api;

use crate::api::ApiServer;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// My replica ID, an index into the peers list.
    #[arg(short, long)]
    id: u8,

    /// Peer-to-peer UDP addresses of all replicas in ID order, myself
    /// included (e.g., '-p host0:52700,host1:52700,host2:52700').
    #[arg(short, long, value_delimiter = ',', required = true)]
    peers: Vec<String>,

    /// Local IP to use for binding the client-facing listener.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Client-facing API port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52701)]
    api_port: u16,

    /// Protocol-specific replica configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Default wait for a write to be delivered, in millisecs.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(OrdercastError)` on any error.
    fn sanitize(&self) -> Result<(), OrdercastError> {
        if self.api_port <= 1024 {
            Err(OrdercastError::msg(format!(
                "invalid api_port {}",
                self.api_port
            )))
        } else if self.peers.is_empty() || self.peers.len() > u8::MAX as usize
        {
            Err(OrdercastError::msg(format!(
                "invalid number of peers {}",
                self.peers.len()
            )))
        } else if self.id as usize >= self.peers.len() {
            Err(OrdercastError::msg(format!(
                "invalid replica ID {} / {}",
                self.id,
                self.peers.len()
            )))
        } else if self.timeout_ms == 0 {
            Err(OrdercastError::msg(format!(
                "invalid timeout duration {} ms",
                self.timeout_ms
            )))
        } else if self.threads < 2 {
            Err(OrdercastError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }

    /// Replica config string with '+' turned into newlines, `None` if empty.
    fn config_str(&self) -> Option<String> {
        if self.config.is_empty() {
            None
        } else {
            Some(self.config.replace('+', "\n"))
        }
    }
}

/// Actual main function of Ordercast replica node.
fn server_main() -> Result<(), OrdercastError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let membership = Arc::new(StaticMembership::parse(&args.peers)?);

    // parse client-facing API address
    let api_addr: SocketAddr = format!("{}:{}", args.bind_ip, args.api_port)
        .parse()
        .map_err(|e| {
            OrdercastError::msg(format!(
                "failed to parse api_addr: bind_ip {} port {}: {}",
                args.bind_ip, args.api_port, e
            ))
        })?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("s"; "error sending to term channel: {}", e);
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

        // enter tokio runtime, setup the replica and its client-facing API,
        // and start the main event loop logic
        runtime.block_on(async move {
            let store = MarketStore::new();
            let config_str = args.config_str();
            let (mut replica, handle) = RotSeqReplica::new_and_setup(
                args.id,
                membership,
                store.clone(),
                config_str.as_deref(),
            )
            .await?;

            let api = ApiServer::new_and_setup(
                args.id,
                api_addr,
                handle,
                store,
                Duration::from_millis(args.timeout_ms),
            )
            .await?;
            let api_task = tokio::spawn(api.run(rx_term.clone()));

            let result = replica.run(rx_term).await;
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

/// Main function of Ordercast replica node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("s"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        pf_warn!("s"; "server_main exited successfully");
        ExitCode::SUCCESS
    }
}
