//! Transport Connection Manager
//!
//! Keeps one realtime channel to the backend alive. A single driver task dials,
//! pumps frames while the channel is open, and after any close or failed dial
//! waits a fixed delay before dialing again. Handles on the manager are cheap
//! and synchronous: `connect`, `disconnect`, and `send` only touch shared
//! state and never wait on the network.

use crate::transport::{FrameSink, FrameStream, Transport, TransportError, WebSocketTransport};
use paco_core::{Outbound, protocol::ChatRequest};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Notices delivered to the current listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Closed,
    /// Informational. A close notice and a reconnect always follow.
    Error(String),
    /// One raw inbound payload.
    Message(String),
}

pub trait ConnectionListener: Send + Sync {
    fn on_event(&self, event: ConnectionEvent);
}

impl<F> ConnectionListener for F
where
    F: Fn(ConnectionEvent) + Send + Sync,
{
    fn on_event(&self, event: ConnectionEvent) {
        self(event)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub reconnect_delay: Duration,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

struct Shared {
    state: ConnectionState,
    writer: Option<mpsc::UnboundedSender<String>>,
    listener: Option<Arc<dyn ConnectionListener>>,
    reconnect_pending: bool,
    retries: u32,
    reconnects_scheduled: u64,
}

impl Shared {
    fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.listener.clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn notify(shared: &Mutex<Shared>, event: ConnectionEvent) {
    // Never call out while holding the lock.
    let listener = lock(shared).listener();
    if let Some(listener) = listener {
        listener.on_event(event);
    }
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    shared: Arc<Mutex<Shared>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Idle,
                writer: None,
                listener: None,
                reconnect_pending: false,
                retries: 0,
                reconnects_scheduled: 0,
            })),
            driver: Mutex::new(None),
        }
    }

    /// A manager backed by real WebSockets.
    pub fn websocket(config: ConnectionConfig) -> Self {
        Self::new(config, Arc::new(WebSocketTransport))
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Consecutive failed attempts since the channel was last open.
    pub fn retries(&self) -> u32 {
        lock(&self.shared).retries
    }

    /// Reconnects scheduled over the manager's lifetime.
    pub fn reconnects_scheduled(&self) -> u64 {
        lock(&self.shared).reconnects_scheduled
    }

    /// Replaces the listener. The live connection is left alone.
    pub fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        lock(&self.shared).listener = Some(listener);
    }

    pub fn clear_listener(&self) {
        lock(&self.shared).listener = None;
    }

    /// Starts connecting unless a channel is already open or opening.
    ///
    /// While waiting out the reconnect delay, this skips the wait and dials now.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut driver = lock(&self.driver);
        {
            let mut shared = lock(&self.shared);
            match shared.state {
                ConnectionState::Connecting | ConnectionState::Open => return,
                ConnectionState::Closed if shared.reconnect_pending => {
                    debug!("Skipping reconnect delay.");
                }
                _ => {}
            }
            shared.state = ConnectionState::Connecting;
            shared.reconnect_pending = false;
            shared.writer = None;
        }
        if let Some(previous) = driver.take() {
            previous.abort();
        }
        *driver = Some(tokio::spawn(drive(
            self.config.clone(),
            self.transport.clone(),
            self.shared.clone(),
        )));
    }

    /// Tears the channel down and cancels any scheduled reconnect.
    pub fn disconnect(&self) {
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
        let was_open = {
            let mut shared = lock(&self.shared);
            let was_open = shared.state == ConnectionState::Open;
            shared.state = ConnectionState::Idle;
            shared.writer = None;
            shared.reconnect_pending = false;
            shared.retries = 0;
            was_open
        };
        if was_open {
            info!("Realtime connection closed by client.");
            notify(&self.shared, ConnectionEvent::Closed);
        }
    }

    /// Hands `text` to the open channel. Returns `false`, and drops `text`,
    /// when the channel is not open.
    pub fn send_text(&self, text: String) -> bool {
        let shared = lock(&self.shared);
        match (&shared.state, &shared.writer) {
            (ConnectionState::Open, Some(writer)) => writer.send(text).is_ok(),
            _ => false,
        }
    }
}

impl Outbound for ConnectionManager {
    fn send(&self, request: &ChatRequest) -> bool {
        match serde_json::to_string(request) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(error = %e, "Could not encode chat request.");
                false
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
    }
}

#[instrument(skip_all, fields(url = %config.url))]
async fn drive(config: ConnectionConfig, transport: Arc<dyn Transport>, shared: Arc<Mutex<Shared>>) {
    loop {
        lock(&shared).state = ConnectionState::Connecting;
        debug!("Dialing realtime endpoint.");

        let failure = match transport.open(&config.url).await {
            Ok((sink, stream)) => {
                let (writer, outbound) = mpsc::unbounded_channel();
                {
                    let mut state = lock(&shared);
                    state.state = ConnectionState::Open;
                    state.writer = Some(writer);
                    state.retries = 0;
                }
                info!("Realtime connection open.");
                notify(&shared, ConnectionEvent::Opened);
                pump(sink, stream, outbound, &shared).await
            }
            Err(e) => Some(e),
        };

        let retry = {
            let mut state = lock(&shared);
            state.state = ConnectionState::Closed;
            state.writer = None;
            state.reconnect_pending = true;
            state.retries += 1;
            state.reconnects_scheduled += 1;
            state.retries
        };
        if let Some(e) = failure {
            warn!(error = %e, "Realtime transport error.");
            notify(&shared, ConnectionEvent::Error(e.to_string()));
        }
        info!(
            retry,
            delay_ms = config.reconnect_delay.as_millis() as u64,
            "Realtime connection closed; reconnecting."
        );
        notify(&shared, ConnectionEvent::Closed);

        tokio::time::sleep(config.reconnect_delay).await;
        lock(&shared).reconnect_pending = false;
    }
}

/// Moves frames in both directions until the channel ends.
async fn pump(
    mut sink: Box<dyn FrameSink>,
    mut stream: Box<dyn FrameStream>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shared: &Mutex<Shared>,
) -> Option<TransportError> {
    let failure = loop {
        tokio::select! {
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send_text(text).await {
                    break Some(e);
                }
            }
            incoming = stream.next_text() => match incoming {
                Some(Ok(text)) => notify(shared, ConnectionEvent::Message(text)),
                Some(Err(e)) => break Some(e),
                None => break None,
            },
        }
    };
    sink.close().await;
    failure
}
