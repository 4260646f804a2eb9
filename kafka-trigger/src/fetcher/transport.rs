use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::types::Partition;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("broker i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("no broker address configured")]
    NoBrokers,

    #[error("response of {size} bytes exceeds the {limit} byte limit")]
    ResponseTooLarge { size: usize, limit: usize },

    #[error("connection closed by broker")]
    Closed,

    #[error("broker did not answer within {0:?}")]
    Timeout(Duration),
}

/// One broker connection carrying request/response round trips. Messages are
/// passed without their `i32` size prefix. Held inside `PartitionFetcher`, which
/// is borrowed across awaits in spawned tasks, hence `Sync`.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn round_trip(&mut self, request: Bytes) -> Result<Bytes, TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        partition: &Partition,
    ) -> Result<Box<dyn BrokerConnection>, TransportError>;
}

/// Connects to the configured brokers over TCP.
///
/// There is no metadata lookup: each new connection goes to the next host in
/// the list, so a fetcher that keeps hitting `NOT_LEADER_OR_FOLLOWER` walks
/// the brokers until it reaches the leader.
#[derive(Debug)]
pub struct TcpConnector {
    hosts: Vec<String>,
    next_host: AtomicUsize,
    connect_timeout: Duration,
    max_response_bytes: usize,
}

impl TcpConnector {
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts,
            next_host: AtomicUsize::new(0),
            connect_timeout: Duration::from_secs(10),
            max_response_bytes: 64 * 1024 * 1024,
        }
    }

    /// Comma separated `host:port` list, as in `KAFKA_HOSTS`.
    pub fn from_host_list(hosts: &str) -> Self {
        Self::new(
            hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_max_response_bytes(mut self, max_response_bytes: usize) -> Self {
        self.max_response_bytes = max_response_bytes;
        self
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        partition: &Partition,
    ) -> Result<Box<dyn BrokerConnection>, TransportError> {
        if self.hosts.is_empty() {
            return Err(TransportError::NoBrokers);
        }
        let host = &self.hosts[self.next_host.fetch_add(1, Ordering::Relaxed) % self.hosts.len()];

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;
        debug!(
            host = host.as_str(),
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Connected to broker"
        );

        Ok(Box::new(TcpConnection {
            stream,
            max_response_bytes: self.max_response_bytes,
        }))
    }
}

struct TcpConnection {
    stream: TcpStream,
    max_response_bytes: usize,
}

#[async_trait]
impl BrokerConnection for TcpConnection {
    async fn round_trip(&mut self, request: Bytes) -> Result<Bytes, TransportError> {
        self.stream.write_i32(request.len() as i32).await?;
        self.stream.write_all(&request).await?;
        self.stream.flush().await?;

        let size = match self.stream.read_i32().await {
            Ok(size) => size,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Closed)
            }
            Err(e) => return Err(e.into()),
        };
        if size < 0 || size as usize > self.max_response_bytes {
            warn!(size, "Broker sent an oversized or negative response size");
            return Err(TransportError::ResponseTooLarge {
                size: size.max(0) as usize,
                limit: self.max_response_bytes,
            });
        }

        let mut response = vec![0u8; size as usize];
        self.stream.read_exact(&mut response).await?;
        Ok(Bytes::from(response))
    }
}
