//! Ordercast client executable.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ordercast::server::{ApiReply, ApiRequest};
use ordercast::{logger_init, pf_error, pf_info, OrdercastError};
use tokio::runtime::Builder;
use tokio::time::{Duration, Instant};

mod apistub;

use crate::apistub::ApiStub;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Replica node's client-facing API address.
    #[arg(short, long)]
    server: SocketAddr,

    /// Wait for each write to be delivered, in millisecs.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Client utility to run.
    #[command(subcommand)]
    utility: Utility,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Utility {
    /// Issue one replicated write.
    Write {
        /// Write operation name (e.g., 'CreateBuyer').
        #[arg(short, long)]
        ops: String,

        /// Operation arguments as a JSON object.
        #[arg(short, long)]
        payload: String,

        /// Request ID to reuse when retrying a timed out write.
        #[arg(long)]
        id: Option<String>,
    },

    /// Read one record from the node's local storage.
    Read {
        /// Table name (e.g., 'cart_items').
        #[arg(short, long)]
        table: String,

        /// Record key ('cart_id/product_id' for cart items).
        #[arg(short, long)]
        key: String,
    },

    /// Issue a number of CreateBuyer writes back to back and report rate and
    /// latency.
    Bench {
        /// Number of writes to issue.
        #[arg(short, long, default_value_t = 1000)]
        count: usize,
    },
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(OrdercastError)` on any error.
    fn sanitize(&self) -> Result<(), OrdercastError> {
        if self.timeout_ms == 0 {
            return Err(OrdercastError::msg(format!(
                "invalid timeout duration {} ms",
                self.timeout_ms
            )));
        }
        match &self.utility {
            Utility::Write { payload, .. } => {
                let value: serde_json::Value = serde_json::from_str(payload)?;
                if !value.is_object() {
                    return Err(OrdercastError::msg(
                        "payload must be a JSON object",
                    ));
                }
                Ok(())
            }
            Utility::Bench { count } if *count == 0 => {
                Err(OrdercastError::msg("invalid bench count 0"))
            }
            _ => Ok(()),
        }
    }
}

/// Runs the bench utility: sequential CreateBuyer writes.
async fn run_bench(
    stub: &mut ApiStub,
    count: usize,
    timeout_ms: u64,
) -> Result<(), OrdercastError> {
    let tag: u32 = rand::random();
    let mut latencies = Vec::with_capacity(count);
    let mut errors = 0;
    let start = Instant::now();

    for i in 0..count {
        let req = ApiRequest::Write {
            ops: "CreateBuyer".into(),
            payload: serde_json::json!({
                "id": format!("bench-{:08x}-{}", tag, i),
                "name": format!("buyer {}", i),
            }),
            id: None,
            timeout_ms: Some(timeout_ms),
        };
        let issued = Instant::now();
        match stub.request(&req).await? {
            ApiReply::Written { .. } => latencies.push(issued.elapsed()),
            reply => {
                errors += 1;
                pf_error!("c"; "write {} failed: {:?}", i, reply);
            }
        }
    }

    let elapsed = start.elapsed();
    let done = latencies.len();
    let avg = latencies.iter().sum::<Duration>() / (done.max(1) as u32);
    latencies.sort_unstable();
    let p99 = latencies
        .get(done.saturating_sub(1) * 99 / 100)
        .copied()
        .unwrap_or_default();
    pf_info!("c"; "{} writes ok, {} failed in {:.2?}: {:.1} writes/s, avg {:.2?}, p99 {:.2?}",
                  done, errors, elapsed,
                  done as f64 / elapsed.as_secs_f64(), avg, p99);
    Ok(())
}

/// Actual main function of Ordercast client.
fn client_main() -> Result<(), OrdercastError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let runtime = Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async move {
        let mut stub = ApiStub::connect(args.server).await?;

        match args.utility {
            Utility::Write { ops, payload, id } => {
                let req = ApiRequest::Write {
                    ops,
                    payload: serde_json::from_str(&payload)?,
                    id,
                    timeout_ms: Some(args.timeout_ms),
                };
                let reply = stub.request(&req).await?;
                println!("{}", serde_json::to_string(&reply)?);
            }
            Utility::Read { table, key } => {
                let reply = stub.request(&ApiRequest::Read { table, key }).await?;
                println!("{}", serde_json::to_string(&reply)?);
            }
            Utility::Bench { count } => {
                run_bench(&mut stub, count, args.timeout_ms).await?;
            }
        }
        Ok::<(), OrdercastError>(()) // give type hint for this async closure
    })
}

/// Main function of Ordercast client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("c"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
