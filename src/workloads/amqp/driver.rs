//! Async task that owns a session.
//!
//! Commands from the connection reader and dispatch requests from queues are
//! serialized through one `tokio::select!` loop, so the session itself never
//! needs a lock. The loop ends when every client handle is dropped or a
//! command fails with a connection-fatal error; either way the session is
//! closed and its outstanding deliveries return to their queues.

use super::commands::{CommandOutcome, MessageCommand};
use super::errors::{SessionError, SessionResult};
use super::handler::MessageHandler;
use super::session::Session;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

const DEFAULT_REQUEST_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("session driver stopped")]
    Stopped,
}

enum DriverRequest {
    Command {
        command: MessageCommand,
        reply: oneshot::Sender<SessionResult<CommandOutcome>>,
    },
    Acknowledge {
        transfers: Vec<u64>,
        reply: oneshot::Sender<SessionResult<()>>,
    },
}

/// Handle used by the connection to feed a running [`SessionDriver`].
#[derive(Debug, Clone)]
pub struct SessionClient {
    tx: mpsc::Sender<DriverRequest>,
}

impl std::fmt::Debug for DriverRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverRequest::Command { command, .. } => {
                f.debug_tuple("Command").field(&command.name()).finish()
            }
            DriverRequest::Acknowledge { transfers, .. } => {
                f.debug_tuple("Acknowledge").field(transfers).finish()
            }
        }
    }
}

impl SessionClient {
    pub async fn command(&self, command: MessageCommand) -> Result<CommandOutcome, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DriverRequest::Command { command, reply })
            .await
            .map_err(|_| DriverError::Stopped)?;
        Ok(rx.await.map_err(|_| DriverError::Stopped)??)
    }

    pub async fn acknowledge(&self, transfers: Vec<u64>) -> Result<(), DriverError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DriverRequest::Acknowledge { transfers, reply })
            .await
            .map_err(|_| DriverError::Stopped)?;
        Ok(rx.await.map_err(|_| DriverError::Stopped)??)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct SessionDriver {
    handler: MessageHandler,
    requests: mpsc::Receiver<DriverRequest>,
}

impl SessionDriver {
    pub fn new(session: Session) -> (Self, SessionClient) {
        Self::with_capacity(session, DEFAULT_REQUEST_CAPACITY)
    }

    pub fn with_capacity(session: Session, capacity: usize) -> (Self, SessionClient) {
        let (tx, requests) = mpsc::channel(capacity);
        (
            Self {
                handler: MessageHandler::new(session),
                requests,
            },
            SessionClient { tx },
        )
    }

    /// Spawn the driver on the current runtime.
    pub fn spawn(session: Session) -> (SessionClient, tokio::task::JoinHandle<Session>) {
        let (driver, client) = Self::new(session);
        (client, tokio::spawn(driver.run()))
    }

    /// Run until the clients go away or the connection must close. Returns
    /// the closed session.
    pub async fn run(mut self) -> Session {
        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        debug!(session = %self.handler.session().id(), "all session clients dropped");
                        break;
                    };
                    if !self.handle_request(request) {
                        break;
                    }
                }
                Some(delivered) = self.handler.session_mut().next_dispatch() => {
                    if delivered > 0 {
                        debug!(session = %self.handler.session().id(), delivered, "dispatch woke session");
                    }
                }
            }
        }

        let mut session = self.handler.into_session();
        session.close();
        info!(session = %session.id(), "session driver stopped");
        session
    }

    /// Returns false when the connection has to close.
    fn handle_request(&mut self, request: DriverRequest) -> bool {
        match request {
            DriverRequest::Command { command, reply } => {
                let result = self.handler.handle(command);
                let fatal = matches!(&result, Err(err) if err.is_connection_fatal());
                let _ = reply.send(result);
                !fatal
            }
            DriverRequest::Acknowledge { transfers, reply } => {
                let result = self.handler.acknowledge(&transfers);
                let fatal = matches!(&result, Err(err) if err.is_connection_fatal());
                let _ = reply.send(result);
                !fatal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionConfig;
    use crate::messaging::{FieldTable, Message, QueueRegistry};
    use crate::workloads::amqp::delivery::ChannelProxy;
    use std::sync::Arc;

    fn subscribe(tag: &str) -> MessageCommand {
        MessageCommand::Subscribe {
            queue: "q".into(),
            destination: tag.into(),
            no_local: false,
            confirm_mode: 1,
            acquire_mode: 0,
            exclusive: false,
            filter: FieldTable::new(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_wakes_driver() {
        let queues = Arc::new(QueueRegistry::new());
        let queue = queues.declare("q");
        let (proxy, mut events) = ChannelProxy::new();
        let session = Session::new("s1", SessionConfig::default(), queues, Box::new(proxy));
        let (client, handle) = SessionDriver::spawn(session);

        client.command(subscribe("c1")).await.unwrap();
        client
            .command(MessageCommand::Flow {
                destination: "c1".into(),
                unit: 0,
                value: 10,
            })
            .await
            .unwrap();

        queue.enqueue(Message::new("late"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.as_transfer().unwrap().sequence, 1);

        client.acknowledge(vec![1, 1]).await.unwrap();
        drop(client);
        let session = handle.await.unwrap();
        assert!(session.tracker().is_empty());
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_driver() {
        let queues = Arc::new(QueueRegistry::new());
        queues.declare("q");
        let (proxy, _events) = ChannelProxy::new();
        let session = Session::new("s1", SessionConfig::default(), queues, Box::new(proxy));
        let (client, handle) = SessionDriver::spawn(session);

        let err = client.command(MessageCommand::Ok).await.unwrap_err();
        assert!(matches!(err, DriverError::Session(SessionError::NotImplemented(_))));
        handle.await.unwrap();
        assert!(matches!(
            client.command(subscribe("c1")).await,
            Err(DriverError::Stopped)
        ));
    }
}
