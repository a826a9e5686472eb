//! State shared between the client façade and the event loop.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embassy_sync::signal::Signal;

use crate::client::MqttEvent;
use crate::error::ConnectError;
use crate::message::Message;
use crate::session::Session;

/// Depth of the inbound message queue.
pub const MESSAGE_QUEUE_DEPTH: usize = 4;

/// Depth of the connection event queue. Events beyond it are dropped.
pub const EVENT_QUEUE_DEPTH: usize = 4;

/// Requests from the façade to the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Command {
    Connect,
    Disconnect,
}

/// Everything the client handles and the event loop share.
///
/// Create one per broker connection and keep it alive for as long as the client
/// and the event loop run, typically in a `StaticCell`:
///
/// ```ignore
/// static STATE: StaticCell<MqttState> = StaticCell::new();
/// let state = STATE.init(MqttState::new());
/// let client = MqttClient::new(state);
/// let event_loop = MqttEventLoop::<_, 1024>::new(transport, state);
/// ```
pub struct MqttState {
    pub(crate) session: Mutex<CriticalSectionRawMutex, RefCell<Session>>,
    pub(crate) commands: Channel<CriticalSectionRawMutex, Command, 1>,
    /// Serializes connect and disconnect calls.
    pub(crate) control: AsyncMutex<CriticalSectionRawMutex, ()>,
    pub(crate) connect_result: Signal<CriticalSectionRawMutex, Result<(), ConnectError>>,
    pub(crate) disconnected: Signal<CriticalSectionRawMutex, ()>,
    /// Raised whenever new frames are queued for the writer.
    pub(crate) outbound: Signal<CriticalSectionRawMutex, ()>,
    pub(crate) messages: Channel<CriticalSectionRawMutex, Message, MESSAGE_QUEUE_DEPTH>,
    pub(crate) events: Channel<CriticalSectionRawMutex, MqttEvent, EVENT_QUEUE_DEPTH>,
}

impl Default for MqttState {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttState {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(RefCell::new(Session::new())),
            commands: Channel::new(),
            control: AsyncMutex::new(()),
            connect_result: Signal::new(),
            disconnected: Signal::new(),
            outbound: Signal::new(),
            messages: Channel::new(),
            events: Channel::new(),
        }
    }

    /// Runs `f` with exclusive access to the session.
    pub(crate) fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        self.session.lock(|session| f(&mut session.borrow_mut()))
    }

    /// Queues a connection event, dropping it if nobody keeps up.
    pub(crate) fn emit(&self, event: MqttEvent) {
        if self.events.try_send(event).is_err() {
            debug!("event queue full, event dropped");
        }
    }
}
