//! Client-facing API: newline-delimited JSON over TCP. Writes go through the
//! replication handle; reads are served straight from local storage.

use std::net::SocketAddr;
use std::str::FromStr;

use ordercast::server::{
    ApiReply, ApiRequest, MarketStore, OpsType, ReplicaId, ReplicationHandle,
    Table,
};
use ordercast::{pf_debug, pf_info, pf_warn, OrdercastError};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Duration;

/// Client-facing API server of one replica node.
pub struct ApiServer {
    /// My replica ID.
    me: ReplicaId,

    /// Handle for originating writes on my replica.
    handle: ReplicationHandle,

    /// Local storage, for reads.
    store: MarketStore,

    /// Wait used for writes that do not carry their own timeout.
    default_timeout: Duration,

    /// TCP listener for client connections.
    listener: TcpListener,
}

impl ApiServer {
    /// Binds the client-facing listener.
    pub async fn new_and_setup(
        me: ReplicaId,
        api_addr: SocketAddr,
        handle: ReplicationHandle,
        store: MarketStore,
        default_timeout: Duration,
    ) -> Result<Self, OrdercastError> {
        let listener = TcpListener::bind(api_addr).await?;
        pf_info!(me; "accepting clients on {}", api_addr);
        Ok(ApiServer {
            me,
            handle,
            store,
            default_timeout,
            listener,
        })
    }

    /// Accepts clients until termination, serving each on its own task.
    pub async fn run(
        self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), OrdercastError> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!(self.me; "error accepting client: {}", e);
                            continue;
                        }
                    };
                    pf_debug!(self.me; "client {} connected", addr);

                    let me = self.me;
                    let handle = self.handle.clone();
                    let store = self.store.clone();
                    let default_timeout = self.default_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = Self::serve_client(
                            stream, &handle, &store, default_timeout,
                        )
                        .await
                        {
                            pf_warn!(me; "client {} dropped: {}", addr, e);
                        }
                    });
                },

                _ = rx_term.changed() => {
                    return Ok(());
                }
            }
        }
    }

    /// Serves one client connection until it closes.
    async fn serve_client(
        stream: TcpStream,
        handle: &ReplicationHandle,
        store: &MarketStore,
        default_timeout: Duration,
    ) -> Result<(), OrdercastError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let reply = match serde_json::from_str::<ApiRequest>(&line) {
                Ok(req) => {
                    Self::handle_request(req, handle, store, default_timeout)
                        .await
                }
                Err(e) => ApiReply::Error(format!("malformed request: {}", e)),
            };

            let mut bytes = serde_json::to_vec(&reply)?;
            bytes.push(b'\n');
            write_half.write_all(&bytes).await?;
        }
        Ok(())
    }

    /// Executes one API request.
    pub async fn handle_request(
        req: ApiRequest,
        handle: &ReplicationHandle,
        store: &MarketStore,
        default_timeout: Duration,
    ) -> ApiReply {
        let result = match req {
            ApiRequest::Write {
                ops,
                payload,
                id,
                timeout_ms,
            } => {
                let timeout =
                    timeout_ms.map_or(default_timeout, Duration::from_millis);
                Self::write(handle, &ops, &payload, id, timeout).await
            }
            ApiRequest::Read { table, key } => match Table::parse_name(&table) {
                Some(table) => Ok(ApiReply::Record(store.get(table, &key))),
                None => Err(OrdercastError::msg(format!(
                    "unknown table '{}'",
                    table
                ))),
            },
        };
        result.unwrap_or_else(|e| ApiReply::Error(e.to_string()))
    }

    async fn write(
        handle: &ReplicationHandle,
        ops: &str,
        payload: &serde_json::Value,
        id: Option<String>,
        timeout: Duration,
    ) -> Result<ApiReply, OrdercastError> {
        let ops = OpsType::from_str(ops)?;
        let payload = serde_json::to_vec(payload)?;
        let id = id.unwrap_or_else(|| handle.new_request_id());
        let completion = handle
            .submit_with_id(id.clone(), ops, payload.into())
            .await?;
        let global_seq = completion.wait(timeout).await?;
        Ok(ApiReply::Written { id, global_seq })
    }
}
