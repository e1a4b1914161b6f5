//! Client-side stub of a replica node's line-JSON API.

use std::net::SocketAddr;

use ordercast::server::{ApiReply, ApiRequest};
use ordercast::{logged_err, OrdercastError};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Connection to one replica node's client-facing API.
pub struct ApiStub {
    /// Address of the node.
    addr: SocketAddr,

    /// Reply lines from the node.
    lines: Lines<BufReader<OwnedReadHalf>>,

    /// Request sink to the node.
    write_half: OwnedWriteHalf,
}

impl ApiStub {
    /// Connects to the node at `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self, OrdercastError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(ApiStub {
            addr,
            lines: BufReader::new(read_half).lines(),
            write_half,
        })
    }

    /// Sends one request and waits for its reply.
    pub async fn request(
        &mut self,
        req: &ApiRequest,
    ) -> Result<ApiReply, OrdercastError> {
        let mut bytes = serde_json::to_vec(req)?;
        bytes.push(b'\n');
        self.write_half.write_all(&bytes).await?;

        match self.lines.next_line().await? {
            Some(line) => Ok(serde_json::from_str(&line)?),
            None => logged_err!("c"; "server {} closed connection", self.addr),
        }
    }
}
