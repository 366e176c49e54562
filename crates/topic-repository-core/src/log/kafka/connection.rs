//! Single Kafka broker connection.
//!
//! Manages a TCP connection to a single Kafka broker with correlation ID
//! tracking for request/response matching.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{RequestHeader, ResponseHeader};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, Request, StrBytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::{LogError, LogResult};

/// A connection to a single Kafka broker.
///
/// Requests are serialized over one TCP stream. A request that fails or
/// times out mid-flight drops the stream; the next request reconnects.
pub struct BrokerConnection {
    broker_id: i32,
    address: String,
    client_id: StrBytes,
    stream: Mutex<Option<TcpStream>>,
    correlation_id: AtomicI32,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl BrokerConnection {
    /// Create a new broker connection (not yet connected).
    #[must_use]
    pub fn new(
        broker_id: i32,
        address: String,
        client_id: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            broker_id,
            address,
            client_id: StrBytes::from_string(client_id.to_string()),
            stream: Mutex::new(None),
            correlation_id: AtomicI32::new(0),
            connect_timeout,
            request_timeout,
        }
    }

    #[must_use]
    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Check if the connection is established.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Connect to the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or times out.
    #[instrument(skip(self), fields(broker_id = self.broker_id, address = %self.address))]
    pub async fn connect(&self) -> LogResult<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(self.open_stream().await?);
        debug!("connected to broker");
        Ok(())
    }

    async fn open_stream(&self) -> LogResult<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to connect to broker");
                Err(LogError::BrokerUnavailable {
                    broker_id: self.broker_id,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                warn!("connection timeout");
                Err(LogError::BrokerUnavailable {
                    broker_id: self.broker_id,
                    message: "connection timeout".to_string(),
                })
            }
        }
    }

    /// Disconnect from the broker.
    pub async fn disconnect(&self) {
        *self.stream.lock().await = None;
    }

    /// Send a typed request and decode its response.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Timeout`] when the round-trip exceeds the request
    /// timeout, and a protocol or connection error otherwise.
    pub async fn request<R: Request>(&self, request: &R, api_version: i16) -> LogResult<R::Response> {
        let correlation_id = self.next_correlation_id();
        let header = RequestHeader::default()
            .with_request_api_key(R::KEY)
            .with_request_api_version(api_version)
            .with_correlation_id(correlation_id)
            .with_client_id(Some(self.client_id.clone()));

        let mut buf = BytesMut::new();
        header
            .encode(&mut buf, R::header_version(api_version))
            .map_err(|e| LogError::Protocol {
                message: format!("failed to encode request header: {e}"),
            })?;
        request
            .encode(&mut buf, api_version)
            .map_err(|e| LogError::Protocol {
                message: format!("failed to encode request {}: {e}", R::KEY),
            })?;

        let mut response = self.send_request(&buf).await?;

        ResponseHeader::decode(&mut response, R::Response::header_version(api_version)).map_err(
            |e| LogError::Protocol {
                message: format!("failed to decode response header: {e}"),
            },
        )?;
        R::Response::decode(&mut response, api_version).map_err(|e| LogError::Protocol {
            message: format!("failed to decode response {}: {e}", R::KEY),
        })
    }

    /// Send a raw request and receive the response.
    ///
    /// `request_bytes` holds the request header and body without the length
    /// prefix. The returned bytes start with the response header.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The connection cannot be established
    /// - Writing or reading fails
    /// - The response correlation ID doesn't match
    /// - The round-trip exceeds the request timeout
    #[instrument(skip(self, request_bytes), fields(broker_id = self.broker_id))]
    pub async fn send_request(&self, request_bytes: &[u8]) -> LogResult<Bytes> {
        if request_bytes.len() < 8 {
            return Err(LogError::Protocol {
                message: "request too short".to_string(),
            });
        }
        let correlation_id = i32::from_be_bytes([
            request_bytes[4],
            request_bytes[5],
            request_bytes[6],
            request_bytes[7],
        ]);

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_stream().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(LogError::Closed);
        };

        debug!(
            correlation_id,
            request_len = request_bytes.len(),
            "sending request"
        );

        let mut write_buf = BytesMut::with_capacity(4 + request_bytes.len());
        write_buf.put_u32(request_bytes.len() as u32);
        write_buf.extend_from_slice(request_bytes);

        let round_trip = timeout(self.request_timeout, async {
            stream.write_all(&write_buf).await?;
            stream.flush().await?;

            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let response_len = u32::from_be_bytes(len_buf) as usize;

            let mut response_buf = vec![0u8; response_len];
            stream.read_exact(&mut response_buf).await?;
            Ok::<_, std::io::Error>(response_buf)
        })
        .await;

        let response_buf = match round_trip {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => {
                *guard = None;
                return Err(LogError::Connection(e));
            }
            Err(_) => {
                // the response may still arrive and would desync the stream
                *guard = None;
                return Err(LogError::Timeout(format!(
                    "no response from broker {} within {:?}",
                    self.broker_id, self.request_timeout
                )));
            }
        };

        if response_buf.len() < 4 {
            *guard = None;
            return Err(LogError::Protocol {
                message: "response too short".to_string(),
            });
        }
        let response_correlation_id = i32::from_be_bytes([
            response_buf[0],
            response_buf[1],
            response_buf[2],
            response_buf[3],
        ]);
        if response_correlation_id != correlation_id {
            *guard = None;
            return Err(LogError::CorrelationIdMismatch {
                expected: correlation_id,
                actual: response_correlation_id,
            });
        }

        debug!(
            correlation_id,
            response_len = response_buf.len(),
            "received response"
        );

        Ok(Bytes::from(response_buf))
    }

    /// Generate a new correlation ID.
    #[must_use]
    pub fn next_correlation_id(&self) -> i32 {
        self.correlation_id.fetch_add(1, Ordering::Relaxed)
    }
}
