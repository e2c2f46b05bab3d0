//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Building sessions over a shared in-memory queue registry
//! - Capturing proxy output
//! - Building message-class commands with wire defaults

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use courier::config::SessionConfig;
use courier::messaging::{FieldTable, Message, Queue, QueueHandle, QueueRegistry};
use courier::workloads::amqp::{
    CommandOutcome, Delivery, MessageCommand, MessageHandler, RecordingProxy, Session,
    SessionResult,
};
use std::sync::Arc;

/// One session plus the proxy that records its output.
pub struct TestSession {
    pub handler: MessageHandler,
    pub proxy: RecordingProxy,
}

impl TestSession {
    pub fn handle(&mut self, command: MessageCommand) -> SessionResult<CommandOutcome> {
        self.handler.handle(command)
    }

    pub fn transfers(&self) -> Vec<Delivery> {
        self.proxy.transfers()
    }

    /// Run delivery passes for requests raised outside this session.
    pub fn pump(&mut self) -> usize {
        self.handler.session_mut().dispatch_pending()
    }
}

/// A broker-in-a-box: queue registry shared by any number of sessions.
pub struct Broker {
    pub queues: Arc<QueueRegistry>,
    pub config: SessionConfig,
}

impl Broker {
    pub fn new(queue_names: &[&str]) -> Self {
        Self::with_config(queue_names, SessionConfig::default())
    }

    pub fn with_config(queue_names: &[&str], config: SessionConfig) -> Self {
        let queues = Arc::new(QueueRegistry::new());
        for name in queue_names {
            queues.declare(name);
        }
        Self { queues, config }
    }

    pub fn session(&self, id: &str) -> TestSession {
        let proxy = RecordingProxy::new();
        let session = Session::new(
            id,
            self.config.clone(),
            self.queues.clone(),
            Box::new(proxy.clone()),
        );
        TestSession {
            handler: MessageHandler::new(session),
            proxy,
        }
    }

    pub fn queue(&self, name: &str) -> QueueHandle {
        self.queues.resolve(name).expect("queue declared")
    }

    pub fn publish(&self, queue: &str, payload: &str) -> u64 {
        self.queue(queue).enqueue(Message::new(payload))
    }
}

pub fn subscribe(queue: &str, destination: &str) -> MessageCommand {
    MessageCommand::Subscribe {
        queue: queue.into(),
        destination: destination.into(),
        no_local: false,
        confirm_mode: 1,
        acquire_mode: 0,
        exclusive: false,
        filter: FieldTable::new(),
    }
}

pub fn subscribe_with(
    queue: &str,
    destination: &str,
    confirm_mode: u8,
    acquire_mode: u8,
    exclusive: bool,
) -> MessageCommand {
    MessageCommand::Subscribe {
        queue: queue.into(),
        destination: destination.into(),
        no_local: false,
        confirm_mode,
        acquire_mode,
        exclusive,
        filter: FieldTable::new(),
    }
}

pub fn message_credit(destination: &str, value: u32) -> MessageCommand {
    MessageCommand::Flow {
        destination: destination.into(),
        unit: 0,
        value,
    }
}

pub fn byte_credit(destination: &str, value: u32) -> MessageCommand {
    MessageCommand::Flow {
        destination: destination.into(),
        unit: 1,
        value,
    }
}

pub fn acquire(transfers: &[u64]) -> MessageCommand {
    MessageCommand::Acquire {
        transfers: transfers.to_vec(),
        mode: 0,
    }
}

pub fn release(transfers: &[u64]) -> MessageCommand {
    MessageCommand::Release {
        transfers: transfers.to_vec(),
    }
}

pub fn reject(transfers: &[u64]) -> MessageCommand {
    MessageCommand::Reject {
        transfers: transfers.to_vec(),
        code: 0,
        text: String::new(),
    }
}
