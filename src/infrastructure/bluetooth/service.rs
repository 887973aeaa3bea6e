//! Bluetooth Service Module
//!
//! Runs the [`SessionManager`] on its own task. Caller commands and
//! transport reports are funnelled into one loop, so every state change
//! happens on a single task no matter which thread the Bluetooth stack
//! calls back on.

use crate::domain::error::SessionError;
use crate::domain::models::{ConnectionState, EventSink};
use crate::infrastructure::bluetooth::session::SessionManager;
use crate::infrastructure::bluetooth::transport::{Transport, TransportEventReceiver};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Requests handled by the session task
#[derive(Debug)]
pub enum SessionCommand {
    Connect {
        address: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
}

/// Cloneable handle for talking to the session task.
///
/// Once the task has stopped, commands fail with
/// [`SessionError::TransportUnavailable`].
#[derive(Debug, Clone)]
pub struct DscClient {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl DscClient {
    pub async fn connect(&self, address: impl Into<String>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Connect {
            address: address.into(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::TransportUnavailable)?
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Disconnect { reply })?;
        rx.await.map_err(|_| SessionError::TransportUnavailable)?
    }

    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(SessionCommand::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn state(&self) -> ConnectionState {
        let (reply, rx) = oneshot::channel();
        if self.send(SessionCommand::State { reply }).is_err() {
            return ConnectionState::Disconnected;
        }
        rx.await.unwrap_or_default()
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::TransportUnavailable)
    }
}

/// Main Bluetooth service owning the session
pub struct BluetoothService;

impl BluetoothService {
    /// Move `manager` onto a new task that also drains `transport_events`.
    ///
    /// The task closes the session and exits when every [`DscClient`] is dropped.
    pub fn spawn<T, S>(
        manager: SessionManager<T, S>,
        transport_events: TransportEventReceiver,
    ) -> (DscClient, JoinHandle<()>)
    where
        T: Transport + 'static,
        S: EventSink + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(manager, rx, transport_events));
        (DscClient { commands: tx }, handle)
    }
}

async fn run<T: Transport, S: EventSink>(
    mut manager: SessionManager<T, S>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut transport_events: TransportEventReceiver,
) {
    info!("Bluetooth service started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("All clients dropped");
                    break;
                };
                execute(&mut manager, command);
            }
            Some(event) = transport_events.recv() => {
                manager.handle_event(event);
            }
        }
    }

    manager.close();
    info!("Bluetooth service stopped");
}

fn execute<T: Transport, S: EventSink>(manager: &mut SessionManager<T, S>, command: SessionCommand) {
    match command {
        SessionCommand::Connect { address, reply } => {
            let _ = reply.send(manager.connect(&address));
        }
        SessionCommand::Disconnect { reply } => {
            let _ = reply.send(manager.disconnect());
        }
        SessionCommand::Close { reply } => {
            manager.close();
            let _ = reply.send(());
        }
        SessionCommand::State { reply } => {
            let _ = reply.send(manager.state());
        }
    }
}
