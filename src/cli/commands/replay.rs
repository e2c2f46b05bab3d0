//! Replay command - drive in-memory sessions from a JSON script.
//!
//! A script is an array of steps run in order against one shared queue
//! registry. Sessions are created on first use and named by the step's
//! `session` field (default `s1`):
//!
//! ```json
//! [
//!   {"step": "publish", "queue": "orders", "payload": "hello"},
//!   {"step": "command", "command": {"command": "subscribe", "queue": "orders", "destination": "c1"}},
//!   {"step": "command", "command": {"command": "flow", "destination": "c1", "unit": 0, "value": 5}},
//!   {"step": "acknowledge", "transfers": [1, 1]}
//! ]
//! ```
//!
//! Each step prints one result object with the proxy events it caused.
//! Command steps list their own session's output under `events` and output
//! they unblocked in other sessions under `woken`.

use crate::cli::args::{OutputFormat, ReplayArgs};
use crate::core::Config;
use crate::messaging::{encode_ranges, FieldTable, Message, QueueRegistry};
use crate::ops::telemetry;
use crate::workloads::amqp::{
    CommandOutcome, MessageCommand, MessageHandler, RecordingProxy, Session, SessionError,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScriptStep {
    Publish {
        queue: String,
        #[serde(default)]
        payload: String,
        #[serde(default)]
        headers: FieldTable,
        /// Publishing session, for no-local consumers.
        #[serde(default)]
        origin: Option<String>,
    },
    Command {
        #[serde(default = "default_session")]
        session: String,
        command: MessageCommand,
    },
    Acknowledge {
        #[serde(default = "default_session")]
        session: String,
        transfers: Vec<u64>,
    },
    Close {
        #[serde(default = "default_session")]
        session: String,
    },
}

fn default_session() -> String {
    "s1".into()
}

pub fn run_replay(args: ReplayArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_from_env()?,
    };
    if let Some(level) = args.log_level {
        config.telemetry.log_level = Some(level);
    }
    config.validate()?;
    telemetry::init_tracing(&config.telemetry)?;

    let steps = load_script(&args.script)?;
    for result in replay_script(&config, steps) {
        let line = match args.format {
            OutputFormat::Json => serde_json::to_string(&result)?,
            OutputFormat::Pretty => serde_json::to_string_pretty(&result)?,
        };
        println!("{line}");
    }
    Ok(())
}

pub fn load_script(path: &Path) -> Result<Vec<ScriptStep>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("unable to read script {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("invalid script {}", path.display()))
}

struct ReplaySession {
    handler: MessageHandler,
    proxy: RecordingProxy,
}

/// Run `steps` and return one result object per step.
pub fn replay_script(config: &Config, steps: Vec<ScriptStep>) -> Vec<Value> {
    let queues = Arc::new(QueueRegistry::new());
    for queue in &config.queues {
        queues.declare(&queue.name);
    }
    let mut sessions: BTreeMap<String, ReplaySession> = BTreeMap::new();
    let open = |name: &str, sessions: &mut BTreeMap<String, ReplaySession>| {
        if !sessions.contains_key(name) {
            let proxy = RecordingProxy::new();
            let session = Session::new(
                name,
                config.session.clone(),
                queues.clone(),
                Box::new(proxy.clone()),
            );
            sessions.insert(
                name.to_string(),
                ReplaySession {
                    handler: MessageHandler::new(session),
                    proxy,
                },
            );
        }
    };

    let mut results = Vec::with_capacity(steps.len());
    for (index, step) in steps.into_iter().enumerate() {
        let result = match step {
            ScriptStep::Publish {
                queue,
                payload,
                headers,
                origin,
            } => {
                let handle = queues.declare(&queue);
                let mut message = Message::new(payload);
                message.headers = headers;
                message.origin = origin;
                let position = handle.enqueue(message);
                let events = wake_sessions(&mut sessions);
                json!({
                    "step": index,
                    "publish": {"queue": queue, "position": position},
                    "events": events,
                })
            }
            ScriptStep::Command { session, command } => {
                open(&session, &mut sessions);
                let name = command.name();
                let outcome = match sessions.get_mut(&session) {
                    Some(replay) => replay.handler.handle(command),
                    None => Err(SessionError::Internal(format!("session {session} missing"))),
                };
                step_result(index, &session, name, outcome.map(outcome_json), &mut sessions)
            }
            ScriptStep::Acknowledge { session, transfers } => {
                open(&session, &mut sessions);
                let outcome = match sessions.get_mut(&session) {
                    Some(replay) => replay.handler.acknowledge(&transfers),
                    None => Err(SessionError::Internal(format!("session {session} missing"))),
                };
                step_result(
                    index,
                    &session,
                    "acknowledge",
                    outcome.map(|()| json!("completed")),
                    &mut sessions,
                )
            }
            ScriptStep::Close { session } => {
                let closed = sessions.remove(&session).is_some();
                // Dropping the session releases its deliveries.
                let events = wake_sessions(&mut sessions);
                json!({"step": index, "session": session, "closed": closed, "events": events})
            }
        };
        results.push(result);
    }
    results
}

/// Let every session deliver what queue activity outside a command made
/// available, before the next step runs.
fn wake_sessions(sessions: &mut BTreeMap<String, ReplaySession>) -> Vec<Value> {
    let mut events = Vec::new();
    for (name, replay) in sessions.iter_mut() {
        replay.handler.session_mut().dispatch_pending();
        for event in replay.proxy.take() {
            events.push(json!({"session": name, "event": event}));
        }
    }
    events
}

fn outcome_json(outcome: CommandOutcome) -> Value {
    match outcome {
        CommandOutcome::Completed => json!("completed"),
        CommandOutcome::Delivered(delivered) => json!({"delivered": delivered}),
        CommandOutcome::Acquired(transfers) => json!({"acquired": encode_ranges(&transfers)}),
    }
}

fn step_result(
    index: usize,
    session: &str,
    command: &str,
    outcome: Result<Value, SessionError>,
    sessions: &mut BTreeMap<String, ReplaySession>,
) -> Value {
    let events: Vec<Value> = sessions
        .get(session)
        .map(|replay| {
            replay
                .proxy
                .take()
                .into_iter()
                .map(|event| json!(event))
                .collect()
        })
        .unwrap_or_default();
    let mut result = match outcome {
        Ok(value) => json!({
            "step": index,
            "session": session,
            "command": command,
            "result": value,
            "events": events,
        }),
        Err(err) => {
            let fatal = err.is_connection_fatal();
            if fatal {
                sessions.remove(session);
            }
            json!({
                "step": index,
                "session": session,
                "command": command,
                "error": {"code": err.code(), "message": err.to_string(), "fatal": fatal},
                "events": events,
            })
        }
    };
    // Releases, cancels and closes can make messages deliverable elsewhere.
    result["woken"] = Value::Array(wake_sessions(sessions));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(json: &str) -> Vec<ScriptStep> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_replay_credit_and_acquire() {
        let results = replay_script(
            &Config::default(),
            steps(
                r#"[
                {"step": "publish", "queue": "q", "payload": "a"},
                {"step": "command", "command": {"command": "subscribe", "queue": "q", "destination": "c1", "acquire_mode": 1}},
                {"step": "command", "command": {"command": "flow", "destination": "c1", "unit": 0, "value": 5}},
                {"step": "command", "command": {"command": "acquire", "transfers": [1, 4]}}
            ]"#,
            ),
        );
        assert_eq!(results.len(), 4);
        assert_eq!(results[2]["events"].as_array().unwrap().len(), 1);
        assert_eq!(results[3]["result"]["acquired"], json!([1, 1]));
    }

    #[test]
    fn test_fatal_error_closes_session() {
        let results = replay_script(
            &Config::default(),
            steps(
                r#"[
                {"step": "command", "command": {"command": "open"}},
                {"step": "command", "session": "s2", "command": {"command": "subscribe", "queue": "nope", "destination": "c1"}}
            ]"#,
            ),
        );
        assert_eq!(results[0]["error"]["code"], 540);
        assert_eq!(results[0]["error"]["fatal"], true);
        assert_eq!(results[1]["error"]["code"], 404);
        assert_eq!(results[1]["error"]["fatal"], false);
    }

    #[test]
    fn test_close_releases_to_other_session() {
        let results = replay_script(
            &Config::default(),
            steps(
                r#"[
                {"step": "publish", "queue": "q", "payload": "a"},
                {"step": "command", "session": "a", "command": {"command": "get", "queue": "q", "destination": "g"}},
                {"step": "command", "session": "b", "command": {"command": "subscribe", "queue": "q", "destination": "c1"}},
                {"step": "command", "session": "b", "command": {"command": "flow", "destination": "c1", "unit": 0, "value": 1}},
                {"step": "close", "session": "a"}
            ]"#,
            ),
        );
        assert_eq!(results[1]["result"]["delivered"], true);
        assert!(results[3]["events"].as_array().unwrap().is_empty());
        let events = results[4]["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["session"], "b");
        assert_eq!(events[0]["event"]["redelivered"], true);
    }

    #[test]
    fn test_release_reports_delivery_to_other_session() {
        let results = replay_script(
            &Config::default(),
            steps(
                r#"[
                {"step": "publish", "queue": "q", "payload": "a"},
                {"step": "command", "session": "a", "command": {"command": "get", "queue": "q", "destination": "g"}},
                {"step": "command", "session": "b", "command": {"command": "subscribe", "queue": "q", "destination": "c1"}},
                {"step": "command", "session": "b", "command": {"command": "flow", "destination": "c1", "unit": 0, "value": 1}},
                {"step": "command", "session": "a", "command": {"command": "release", "transfers": [1, 1]}}
            ]"#,
            ),
        );
        assert!(results[4]["events"].as_array().unwrap().is_empty());
        let woken = results[4]["woken"].as_array().unwrap();
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0]["session"], "b");
        assert_eq!(woken[0]["event"]["token"]["destination"], "c1");
        assert_eq!(woken[0]["event"]["redelivered"], true);
    }
}
