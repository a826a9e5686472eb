//! The connection task.
//!
//! [`MqttEventLoop`] owns the transport and is the only code that reads from or
//! writes to it. It races four things: bytes arriving from the broker, the signal
//! that new frames were queued, the next retransmission or keep-alive deadline, and
//! connect/disconnect commands from the client.
//!
//! Inbound messages are handed over through a bounded channel. When it is full the
//! message is parked and frame processing pauses, but timers and commands are still
//! served. The acknowledgment of a parked message is held back until the
//! application has taken it.

use core::future::poll_fn;

use embassy_futures::select::{Either, Either4, select, select4};
use embassy_sync::channel::TrySendError;
use embassy_time::{Duration, Instant, Timer, with_timeout};

use super::backoff::Backoff;
use super::state::{Command, MqttState};
use crate::client::{MqttEvent, ReconnectOptions};
use crate::error::{ConnectError, ConnectReturnCode, MqttError, ProtocolError};
use crate::message::Message;
use crate::packet::{self, ConnAck, EncodePacket, MqttPacket};
use crate::session::{ConnectionState, Failure, Inbound, KeepAlive, KeepAliveAction, MAX_FRAME_LEN};
use crate::transport::MqttTransport;

enum SessionEnd<E> {
    /// The client asked to disconnect.
    Disconnect,
    Fault(MqttError<E>),
}

/// A message waiting for room in the inbound channel.
struct Parked {
    message: Message,
    /// Sent once the application holds the message.
    ack: Option<MqttPacket<'static>>,
}

enum Input<E> {
    Read(Result<usize, E>),
    /// The inbound channel has room for the parked message.
    Room,
}

/// Drives one MQTT connection, including reconnects.
///
/// `BUF_SIZE` is the size of each of the receive and transmit buffers. It must hold
/// at least [`MAX_FRAME_LEN`] bytes; an inbound frame that does not fit ends the
/// connection.
///
/// Spawn [`run`](Self::run) as its own task:
///
/// ```ignore
/// #[embassy_executor::task]
/// async fn mqtt_task(mut event_loop: MqttEventLoop<'static, TcpTransport<'static>, 1024>) -> ! {
///     event_loop.run().await
/// }
/// ```
pub struct MqttEventLoop<'a, T: MqttTransport, const BUF_SIZE: usize> {
    transport: T,
    state: &'a MqttState,
    rx_buf: [u8; BUF_SIZE],
    rx_len: usize,
    tx_buf: [u8; BUF_SIZE],
    keep_alive: KeepAlive,
    backoff: Backoff,
    parked: Option<Parked>,
}

impl<'a, T: MqttTransport, const BUF_SIZE: usize> MqttEventLoop<'a, T, BUF_SIZE> {
    pub fn new(transport: T, state: &'a MqttState) -> Self {
        const {
            assert!(
                BUF_SIZE >= MAX_FRAME_LEN,
                "BUF_SIZE must hold the largest frame"
            )
        };
        Self {
            transport,
            state,
            rx_buf: [0; BUF_SIZE],
            rx_len: 0,
            tx_buf: [0; BUF_SIZE],
            keep_alive: KeepAlive::new(Duration::from_ticks(0)),
            backoff: Backoff::new(ReconnectOptions::default(), Instant::now().as_ticks() as u32),
            parked: None,
        }
    }

    /// Serves the client forever.
    pub async fn run(&mut self) -> ! {
        loop {
            match self.state.commands.receive().await {
                Command::Connect => match self.establish().await {
                    Ok(session_present) => {
                        self.state.connect_result.signal(Ok(()));
                        self.state.emit(MqttEvent::Connected { session_present });
                        self.supervise().await;
                    }
                    Err(e) => {
                        warn!("connect failed: {:?}", e);
                        self.transport.close().await;
                        self.state
                            .with_session(|s| s.set_state(ConnectionState::Disconnected));
                        self.state.connect_result.signal(Err(e));
                    }
                },
                // Nothing to tear down.
                Command::Disconnect => self.state.disconnected.signal(()),
            }
        }
    }

    /// Opens the transport and performs the CONNECT/CONNACK handshake.
    ///
    /// Returns the broker's session-present flag.
    async fn establish(&mut self) -> Result<bool, ConnectError> {
        let (timeout, keep_alive) = self
            .state
            .with_session(|s| (s.options().connect_timeout, s.options().keep_alive()));

        // Exactly one connection at a time.
        self.transport.close().await;
        self.rx_len = 0;

        match with_timeout(timeout, self.transport.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(ConnectError::Network),
            Err(_) => return Err(ConnectError::Timeout),
        }

        let len = self
            .state
            .with_session(|s| s.encode_connect(&mut self.tx_buf))
            .map_err(ConnectError::Protocol)?;
        self.transport
            .send(&self.tx_buf[..len])
            .await
            .map_err(|_| ConnectError::Network)?;
        debug!("CONNECT sent, waiting for CONNACK");

        let connack = match with_timeout(timeout, self.read_connack()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectError::Timeout),
        };
        if connack.return_code != ConnectReturnCode::Accepted {
            return Err(ConnectError::Refused(connack.return_code));
        }

        self.keep_alive.reset(keep_alive, Instant::now());
        self.state
            .with_session(|s| s.on_connack(connack.session_present));
        info!("connected, session present: {}", connack.session_present);
        Ok(connack.session_present)
    }

    async fn read_connack(&mut self) -> Result<ConnAck, ConnectError> {
        loop {
            let step = match packet::decode(&self.rx_buf[..self.rx_len])
                .map_err(ConnectError::Protocol)?
            {
                Some((MqttPacket::ConnAck(connack), used)) => Some((Ok(connack), used)),
                Some((other, used)) => Some((
                    Err(ConnectError::Protocol(ProtocolError::UnexpectedPacket(
                        other.packet_type(),
                    ))),
                    used,
                )),
                None => None,
            };
            if let Some((connack, used)) = step {
                self.consume(used);
                return connack;
            }
            if self.frame_too_large().map_err(ConnectError::Protocol)? {
                return Err(ConnectError::Protocol(ProtocolError::PayloadTooLarge));
            }
            let n = self
                .transport
                .recv(&mut self.rx_buf[self.rx_len..])
                .await
                .map_err(|_| ConnectError::Network)?;
            if n == 0 {
                return Err(ConnectError::Network);
            }
            self.rx_len += n;
        }
    }

    /// Keeps the connection up until the client disconnects or reconnecting
    /// is given up.
    async fn supervise(&mut self) {
        loop {
            match self.run_session().await {
                SessionEnd::Disconnect => {
                    self.shutdown_gracefully().await;
                    return;
                }
                SessionEnd::Fault(e) => {
                    warn!("connection lost: {}", fault_kind(&e));
                    self.transport.close().await;
                    // The ack belongs to the old connection. The message is kept.
                    if let Some(parked) = self.parked.as_mut() {
                        parked.ack = None;
                    }
                    self.state.with_session(|s| s.connection_lost());
                    self.state.emit(MqttEvent::ConnectionLost);
                    if !self.reconnect().await {
                        return;
                    }
                }
            }
        }
    }

    /// Waits out the backoff and re-establishes the session. Returns `false` when the
    /// supervisor stops, either because the client disconnected or because
    /// reconnecting was given up.
    async fn reconnect(&mut self) -> bool {
        let options = self.state.with_session(|s| s.options().reconnect);
        self.backoff.reset(options);
        loop {
            let Some(delay) = self.backoff.next_delay() else {
                error!("giving up after {} reconnect attempts", self.backoff.attempt());
                self.give_up();
                return false;
            };
            let attempt = self.backoff.attempt();
            let delay_ms = delay.as_millis();
            info!("reconnecting in {} ms (attempt {})", delay_ms, attempt);
            self.state
                .emit(MqttEvent::Reconnecting { attempt, delay_ms });

            if let Either::Second(Command::Disconnect) =
                select(Timer::after(delay), self.state.commands.receive()).await
            {
                self.finish_disconnect();
                return false;
            }

            match self.establish().await {
                Ok(session_present) => {
                    self.state.emit(MqttEvent::Connected { session_present });
                    return true;
                }
                Err(e) if e.is_retryable() => {
                    warn!("reconnect attempt {} failed: {:?}", attempt, e);
                    self.transport.close().await;
                }
                Err(e) => {
                    error!("reconnect refused: {:?}", e);
                    self.transport.close().await;
                    self.give_up();
                    return false;
                }
            }
        }
    }

    fn give_up(&mut self) {
        self.parked = None;
        self.state
            .with_session(|s| s.shutdown(Failure::ConnectionLost));
        self.state.emit(MqttEvent::ReconnectFailed);
    }

    async fn shutdown_gracefully(&mut self) {
        let (timeout, queued) = self.state.with_session(|s| {
            s.set_state(ConnectionState::Disconnecting);
            (s.options().connect_timeout, s.has_outgoing())
        });
        // Best effort; the connection is closed either way.
        let sent = with_timeout(timeout, async {
            if queued {
                self.flush_outgoing().await?;
            }
            self.send_packet(&MqttPacket::Disconnect).await
        })
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            debug!("DISCONNECT not delivered");
        }
        self.transport.close().await;
        self.finish_disconnect();
    }

    fn finish_disconnect(&mut self) {
        self.parked = None;
        self.state.with_session(|s| s.shutdown(Failure::Cancelled));
        info!("disconnected");
        self.state.emit(MqttEvent::Disconnected);
        self.state.disconnected.signal(());
    }

    /// Serves one established connection until it faults or the client disconnects.
    async fn run_session(&mut self) -> SessionEnd<T::Error> {
        loop {
            if let Err(e) = self.flush_outgoing().await {
                return SessionEnd::Fault(e);
            }
            if let Err(e) = self.deliver_parked().await {
                return SessionEnd::Fault(e);
            }

            match self.keep_alive.poll(Instant::now()) {
                KeepAliveAction::SendPing => {
                    trace!("PINGREQ");
                    if let Err(e) = self.send_packet(&MqttPacket::PingReq).await {
                        return SessionEnd::Fault(e);
                    }
                    self.keep_alive.on_ping_sent(Instant::now());
                    continue;
                }
                KeepAliveAction::TimedOut => {
                    warn!("no answer to PINGREQ within keep-alive");
                    return SessionEnd::Fault(MqttError::Timeout);
                }
                KeepAliveAction::Idle => {}
            }

            let deadline = [
                self.state.with_session(|s| s.next_deadline()),
                self.keep_alive.deadline(),
            ]
            .into_iter()
            .flatten()
            .min();

            let state = self.state;
            let event = select4(
                read_or_room(
                    &mut self.transport,
                    &mut self.rx_buf[self.rx_len..],
                    state,
                    self.parked.is_some(),
                ),
                state.outbound.wait(),
                sleep_until(deadline),
                state.commands.receive(),
            )
            .await;

            match event {
                Either4::First(Input::Read(Ok(0))) => {
                    return SessionEnd::Fault(MqttError::ConnectionClosed);
                }
                Either4::First(Input::Read(Ok(n))) => {
                    self.rx_len += n;
                    self.keep_alive.on_receive();
                    if let Err(e) = self.process_frames().await {
                        return SessionEnd::Fault(e);
                    }
                }
                Either4::First(Input::Read(Err(e))) => {
                    return SessionEnd::Fault(MqttError::Transport(e));
                }
                Either4::First(Input::Room) | Either4::Second(()) => {}
                Either4::Third(()) => self.state.with_session(|s| s.tick(Instant::now())),
                Either4::Fourth(Command::Disconnect) => return SessionEnd::Disconnect,
                Either4::Fourth(Command::Connect) => debug!("already connected"),
            }
        }
    }

    /// Decodes and applies every complete frame in the receive buffer. Stops early
    /// while a message is parked.
    async fn process_frames(&mut self) -> Result<(), MqttError<T::Error>> {
        while self.parked.is_none() {
            let now = Instant::now();
            let state = self.state;
            let step = match packet::decode(&self.rx_buf[..self.rx_len])? {
                Some((packet, used)) => {
                    trace!("RX packet type {}", packet.packet_type());
                    Some((state.with_session(|s| s.handle_packet(packet, now)), used))
                }
                None => None,
            };
            let Some((inbound, used)) = step else {
                if self.frame_too_large()? {
                    error!("inbound frame larger than {} bytes", BUF_SIZE);
                    return Err(MqttError::Protocol(ProtocolError::PayloadTooLarge));
                }
                return Ok(());
            };
            self.consume(used);
            self.dispatch(inbound).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, inbound: Inbound) -> Result<(), MqttError<T::Error>> {
        match inbound {
            Inbound::Nothing => {}
            Inbound::Reply(reply) => self.send_packet(&reply).await?,
            Inbound::Deliver(message, ack) => self.deliver(Parked { message, ack }).await?,
            Inbound::Release(comp, message) => {
                self.send_packet(&comp).await?;
                self.deliver(Parked { message, ack: None }).await?;
            }
            Inbound::Fault(e) => return Err(MqttError::Protocol(e)),
        }
        Ok(())
    }

    /// Hands a message to the application, or parks it if the channel is full.
    async fn deliver(&mut self, delivery: Parked) -> Result<(), MqttError<T::Error>> {
        match self.state.messages.try_send(delivery.message) {
            Ok(()) => {
                if let Some(ack) = delivery.ack {
                    self.send_packet(&ack).await?;
                }
            }
            Err(TrySendError::Full(message)) => {
                trace!("inbound queue full, holding message back");
                self.parked = Some(Parked {
                    message,
                    ack: delivery.ack,
                });
            }
        }
        Ok(())
    }

    /// Retries the parked message and, once it is taken, the frames behind it.
    async fn deliver_parked(&mut self) -> Result<(), MqttError<T::Error>> {
        let Some(parked) = self.parked.take() else {
            return Ok(());
        };
        self.deliver(parked).await?;
        if self.parked.is_none() {
            self.process_frames().await?;
        }
        Ok(())
    }

    /// Whether the frame at the head of the receive buffer can never fit it.
    fn frame_too_large(&self) -> Result<bool, ProtocolError> {
        Ok(packet::frame_len(&self.rx_buf[..self.rx_len])?.is_some_and(|len| len > BUF_SIZE))
    }

    /// Writes every frame the session has ready.
    async fn flush_outgoing(&mut self) -> Result<(), MqttError<T::Error>> {
        loop {
            let now = Instant::now();
            let Some(len) = self
                .state
                .with_session(|s| s.next_outgoing(&mut self.tx_buf, now))
            else {
                return Ok(());
            };
            self.send_tx(len).await?;
        }
    }

    async fn send_packet(&mut self, packet: &MqttPacket<'_>) -> Result<(), MqttError<T::Error>> {
        let len = packet.encode(&mut self.tx_buf)?;
        self.send_tx(len).await
    }

    async fn send_tx(&mut self, len: usize) -> Result<(), MqttError<T::Error>> {
        self.transport
            .send(&self.tx_buf[..len])
            .await
            .map_err(MqttError::Transport)?;
        self.keep_alive.on_send(Instant::now());
        Ok(())
    }

    fn consume(&mut self, len: usize) {
        self.rx_buf.copy_within(len..self.rx_len, 0);
        self.rx_len -= len;
    }
}

/// Reads from the broker. While a message is parked, also wakes up as soon as the
/// inbound channel has room, and stops reading once the buffer is full.
async fn read_or_room<T: MqttTransport>(
    transport: &mut T,
    buf: &mut [u8],
    state: &MqttState,
    parked: bool,
) -> Input<T::Error> {
    if !parked {
        return Input::Read(transport.recv(buf).await);
    }
    let room = poll_fn(|cx| state.messages.poll_ready_to_send(cx));
    if buf.is_empty() {
        room.await;
        return Input::Room;
    }
    match select(transport.recv(buf), room).await {
        Either::First(read) => Input::Read(read),
        Either::Second(()) => Input::Room,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => Timer::at(at).await,
        None => core::future::pending().await,
    }
}

fn fault_kind<E>(err: &MqttError<E>) -> &'static str {
    match err {
        MqttError::Transport(_) => "transport error",
        MqttError::Protocol(_) => "protocol violation",
        MqttError::ConnectionClosed => "closed by broker",
        MqttError::Timeout => "keep-alive timeout",
    }
}
