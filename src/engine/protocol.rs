use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BackendError;
use crate::model::output::Output;

/* =========================
   Wire messages
   ========================= */

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteRequest {
    pub msg_id: String,
    pub code: String,
    pub silent: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParentHeader {
    #[serde(default)]
    pub msg_id: Option<String>,
}

/// One message on the kernel's output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelMessage {
    #[serde(default)]
    pub parent_header: ParentHeader,
    pub msg_type: String,
    #[serde(default)]
    pub content: Value,
}

impl KernelMessage {
    pub fn replies_to(&self, msg_id: &str) -> bool {
        self.parent_header.msg_id.as_deref() == Some(msg_id)
    }
}

/// What a correlated message means for the request being collected.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Output(Output),
    ClearOutput,
    Idle,
    Ignore,
}

const OUTPUT_TYPES: [&str; 4] = ["stream", "display_data", "execute_result", "error"];

pub fn classify(msg: &KernelMessage) -> Result<Reply, BackendError> {
    match msg.msg_type.as_str() {
        "status" => {
            let state = msg.content.get("execution_state").and_then(|s| s.as_str());
            Ok(if state == Some("idle") { Reply::Idle } else { Reply::Ignore })
        }
        "execute_input" | "execute_reply" => Ok(Reply::Ignore),
        "clear_output" => Ok(Reply::ClearOutput),
        t if t.starts_with("comm") => Ok(Reply::Ignore),
        t if OUTPUT_TYPES.contains(&t) => output_from_message(msg).map(Reply::Output),
        other => Err(BackendError::Protocol(format!("unhandled message type `{}`", other))),
    }
}

fn output_from_message(msg: &KernelMessage) -> Result<Output, BackendError> {
    let mut fields = match &msg.content {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    fields.insert("output_type".into(), Value::String(msg.msg_type.clone()));

    serde_json::from_value(Value::Object(fields)).map_err(|e| {
        BackendError::Protocol(format!("malformed `{}` message: {}", msg.msg_type, e))
    })
}

/* =========================
   Cancellation
   ========================= */

/// Shared flag that aborts an outstanding collection.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/* =========================
   Collection loop
   ========================= */

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Gather the outputs of request `msg_id` until the kernel reports idle.
///
/// Messages for other requests are dropped, as are messages that cannot be
/// understood. Stops with `Timeout` when `timeout` elapses or when the
/// stream ends before the idle signal, and with `Cancelled` when `cancel`
/// is raised.
pub fn collect_outputs(
    rx: &Receiver<KernelMessage>,
    msg_id: &str,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<Vec<Output>, BackendError> {
    let started = Instant::now();
    let deadline = timeout.map(|t| started + t);
    let mut outputs = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(BackendError::Timeout { after: started.elapsed() });
                }
                (deadline - now).min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };

        let msg = match rx.recv_timeout(wait) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("Kernel stream closed before idle on {}", msg_id);
                return Err(BackendError::Timeout { after: started.elapsed() });
            }
        };

        if !msg.replies_to(msg_id) {
            log::debug!("Discarding {} for another request", msg.msg_type);
            continue;
        }

        match classify(&msg) {
            Ok(Reply::Output(out)) => outputs.push(out),
            Ok(Reply::ClearOutput) => outputs.clear(),
            Ok(Reply::Idle) => return Ok(outputs),
            Ok(Reply::Ignore) => {}
            Err(e) => log::warn!("{}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;

    fn message(parent: &str, msg_type: &str, content: Value) -> KernelMessage {
        KernelMessage {
            parent_header: ParentHeader { msg_id: Some(parent.into()) },
            msg_type: msg_type.into(),
            content,
        }
    }

    #[test]
    fn collects_correlated_outputs_until_idle() {
        let (tx, rx) = mpsc::channel();
        tx.send(message("req-1", "status", json!({"execution_state": "busy"}))).unwrap();
        tx.send(message("req-0", "stream", json!({"name": "stdout", "text": "stale\n"}))).unwrap();
        tx.send(message("req-1", "execute_input", json!({"code": "x"}))).unwrap();
        tx.send(message("req-1", "stream", json!({"name": "stdout", "text": "x is 0\n"}))).unwrap();
        tx.send(message("req-1", "mystery", json!({}))).unwrap();
        tx.send(message(
            "req-1",
            "execute_result",
            json!({"execution_count": 1, "data": {"text/plain": "0"}, "metadata": {}}),
        ))
        .unwrap();
        tx.send(message("req-1", "status", json!({"execution_state": "idle"}))).unwrap();
        tx.send(message("req-1", "stream", json!({"name": "stdout", "text": "late\n"}))).unwrap();

        let outputs = collect_outputs(&rx, "req-1", Some(Duration::from_secs(5)), &CancelToken::default()).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0], Output::stdout("x is 0\n"));
        assert_eq!(outputs[1].plain_text(), Some("0"));
    }

    #[test]
    fn clear_output_drops_earlier_outputs() {
        let (tx, rx) = mpsc::channel();
        tx.send(message("r", "stream", json!({"name": "stdout", "text": "1"}))).unwrap();
        tx.send(message("r", "clear_output", json!({"wait": false}))).unwrap();
        tx.send(message("r", "stream", json!({"name": "stdout", "text": "2"}))).unwrap();
        tx.send(message("r", "status", json!({"execution_state": "idle"}))).unwrap();

        let outputs = collect_outputs(&rx, "r", None, &CancelToken::default()).unwrap();
        assert_eq!(outputs, vec![Output::stdout("2")]);
    }

    #[test]
    fn missing_idle_times_out() {
        let (tx, rx) = mpsc::channel();
        tx.send(message("r", "stream", json!({"name": "stdout", "text": "1"}))).unwrap();

        let err = collect_outputs(&rx, "r", Some(Duration::from_millis(120)), &CancelToken::default())
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
        drop(tx);
    }

    #[test]
    fn closed_stream_before_idle_is_a_timeout() {
        let (tx, rx) = mpsc::channel::<KernelMessage>();
        drop(tx);
        let err = collect_outputs(&rx, "r", None, &CancelToken::default()).unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
    }

    #[test]
    fn cancellation_stops_collection() {
        let (_tx, rx) = mpsc::channel::<KernelMessage>();
        let cancel = CancelToken::default();
        cancel.cancel();
        let err = collect_outputs(&rx, "r", None, &cancel).unwrap_err();
        assert!(matches!(err, BackendError::Cancelled));
    }

    #[test]
    fn error_messages_become_error_outputs() {
        let msg = message(
            "r",
            "error",
            json!({"ename": "NameError", "evalue": "name 'x' is not defined", "traceback": []}),
        );
        match classify(&msg).unwrap() {
            Reply::Output(Output::Error { ename, .. }) => assert_eq!(ename, "NameError"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
