//! # MQTT Transport Abstraction
//!
//! This module defines the `MqttTransport` trait, which abstracts the underlying
//! communication channel (like TCP, TLS over TCP, UART, etc.), allowing the MQTT
//! client to be hardware and network-stack agnostic.
//!
//! A transport owns the knowledge of *where* the broker is, so the event loop can
//! reopen the connection on its own after a fault. A TLS session wrapping a TCP
//! socket plugs in as just another implementation; use [`DEFAULT_TLS_PORT`] for it.
//!
//! With the Rust 2024 Edition, this trait uses native `async fn`, removing the
//! need for the `#[async_trait]` macro.

use core::fmt;
use core::pin::pin;

use embassy_net::IpEndpoint;
use embassy_net::tcp::{ConnectError, Error as TcpError, TcpSocket};
use embassy_time::{Duration, Timer, with_timeout};
use embedded_io_async::Write;
use futures::future::{Either, select};

/// Standard MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Standard MQTT-over-TLS port.
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// A trait representing a reliable, ordered byte stream to the broker.
///
/// Only the event loop calls these methods, one at a time.
#[allow(async_fn_in_trait)]
pub trait MqttTransport {
    /// The error type returned by the transport.
    type Error: fmt::Debug;

    /// Opens a fresh connection to the broker. Any previous connection has been
    /// closed with [`close`](Self::close) before this is called.
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Sends a buffer of data over the transport.
    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Receives data from the transport into a buffer.
    ///
    /// Returns the number of bytes read. A closed connection is an error, never
    /// `Ok(0)`. The future may be dropped before it completes without losing data.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Closes the connection. No further I/O happens on it.
    async fn close(&mut self);
}

/// Errors of the bundled TCP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpTransportError {
    /// Reading or writing the socket failed.
    Tcp(TcpError),
    /// The TCP handshake failed.
    Connect(ConnectError),
    /// The TCP handshake did not finish in time.
    Timeout,
    /// The broker closed the connection.
    Closed,
}

impl fmt::Display for TcpTransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(e) => write!(f, "tcp error: {:?}", e),
            Self::Connect(e) => write!(f, "tcp connect failed: {:?}", e),
            Self::Timeout => f.write_str("tcp connect timed out"),
            Self::Closed => f.write_str("connection closed by peer"),
        }
    }
}

/// TCP transport implementation using `embassy-net`.
pub struct TcpTransport<'a> {
    socket: TcpSocket<'a>,
    remote: IpEndpoint,
    timeout: Duration,
}

impl<'a> TcpTransport<'a> {
    /// Creates a new `TcpTransport` for `remote`. `timeout` bounds the TCP
    /// handshake and the teardown of a previous connection.
    pub fn new(socket: TcpSocket<'a>, remote: impl Into<IpEndpoint>, timeout: Duration) -> Self {
        Self {
            socket,
            remote: remote.into(),
            timeout,
        }
    }

    pub fn remote(&self) -> IpEndpoint {
        self.remote
    }
}

impl MqttTransport for TcpTransport<'_> {
    type Error = TcpTransportError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        // Race the handshake against a timer.
        let outcome = {
            let connect = pin!(self.socket.connect(self.remote));
            let timer = pin!(Timer::after(self.timeout));
            match select(connect, timer).await {
                Either::Left((result, _)) => Some(result),
                Either::Right(_) => None,
            }
        };

        match outcome {
            Some(Ok(())) => {
                debug!("TCP connected");
                Ok(())
            }
            Some(Err(e)) => {
                self.socket.abort();
                Err(TcpTransportError::Connect(e))
            }
            None => {
                self.socket.abort();
                Err(TcpTransportError::Timeout)
            }
        }
    }

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        trace!("TCP TX {} bytes", buf.len());
        self.socket
            .write_all(buf)
            .await
            .map_err(TcpTransportError::Tcp)?;

        // Flush to ensure data is actually sent to the network
        self.socket.flush().await.map_err(TcpTransportError::Tcp)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        match self.socket.read(buf).await {
            // If the peer closes the connection, read returns 0.
            Ok(0) if !buf.is_empty() => Err(TcpTransportError::Closed),
            Ok(n) => {
                trace!("TCP RX {} bytes", n);
                Ok(n)
            }
            Err(e) => Err(TcpTransportError::Tcp(e)),
        }
    }

    async fn close(&mut self) {
        self.socket.abort();
        // Waits for the RST to leave, bounded in case the interface is down.
        let _ = with_timeout(self.timeout, self.socket.flush()).await;
    }
}
