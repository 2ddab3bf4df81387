//! Inbound JSON-lines protocol.
//!
//! Each line is one message tagged by `"type"`; each reply is one JSON
//! object with `"ok": true` and a result, or `"ok": false` and an error.
//! Outbound `invalidation` lines use the same shape a peer accepts inbound.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use chorus_core::cascade::PartialConfig;
use chorus_core::config_cache::LayerKey;
use chorus_core::events::InvalidationBus;
use chorus_core::orchestrator::GenerationOrchestrator;
use chorus_core::types::{GenerationRequest, RequestStatus};
use chorus_core::CoreError;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Generate(GenerationRequest),
    ConfigWrite {
        layer: LayerKey,
        #[serde(default)]
        values: PartialConfig,
    },
    ConfigWriteBulk {
        writes: Vec<BulkWrite>,
    },
    /// An invalidation relayed from another process, in wire form.
    #[serde(alias = "invalidation")]
    Invalidate {
        payload: Value,
    },
    ResetContext {
        persona_id: String,
        personality: String,
    },
    UndoReset {
        persona_id: String,
        personality: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct BulkWrite {
    pub layer: LayerKey,
    #[serde(default)]
    pub values: PartialConfig,
}

#[derive(Clone)]
pub struct Node {
    orchestrator: GenerationOrchestrator,
    bus: InvalidationBus,
}

impl Node {
    pub fn new(orchestrator: GenerationOrchestrator, bus: InvalidationBus) -> Self {
        Self { orchestrator, bus }
    }

    pub async fn dispatch(&self, line: &str) -> Value {
        let message: Inbound = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!("unparseable inbound line: {}", e);
                return json!({"ok": false, "error": format!("invalid message: {}", e)});
            }
        };

        match message {
            Inbound::Generate(request) => {
                let request_id = request.request_id.clone();
                match self.orchestrator.handle(request).await {
                    Ok(reply) => json!({"ok": true, "reply": reply}),
                    Err(e) => failure(&request_id, &e),
                }
            }
            Inbound::ConfigWrite { layer, values } => {
                match self.orchestrator.write_config(layer, values).await {
                    Ok(()) => json!({"ok": true}),
                    Err(e) => json!({"ok": false, "error": e.to_string()}),
                }
            }
            Inbound::ConfigWriteBulk { writes } => {
                let writes = writes.into_iter().map(|w| (w.layer, w.values)).collect();
                match self.orchestrator.write_config_bulk(writes).await {
                    Ok(()) => json!({"ok": true}),
                    Err(e) => json!({"ok": false, "error": e.to_string()}),
                }
            }
            Inbound::Invalidate { payload } => match self.bus.relay_inbound(&payload.to_string()) {
                Ok(delivered) => {
                    debug!(delivered, "relayed invalidation");
                    json!({"ok": true, "delivered": delivered})
                }
                Err(e) => json!({"ok": false, "error": e.to_string()}),
            },
            Inbound::ResetContext {
                persona_id,
                personality,
            } => {
                let epoch = self.orchestrator.reset_context(&persona_id, &personality);
                json!({"ok": true, "epoch": epoch})
            }
            Inbound::UndoReset {
                persona_id,
                personality,
            } => match self.orchestrator.undo_context_reset(&persona_id, &personality) {
                Ok(epoch) => json!({"ok": true, "epoch": epoch}),
                Err(e) => json!({"ok": false, "error": e.to_string()}),
            },
        }
    }
}

/// Outbound line announcing a local invalidation to peers.
pub fn invalidation_line(wire: &str) -> String {
    let payload = serde_json::from_str::<Value>(wire).unwrap_or_else(|_| json!({"scope": "all"}));
    json!({"type": "invalidation", "payload": payload}).to_string()
}

fn failure(request_id: &str, err: &CoreError) -> Value {
    let mut body = json!({
        "ok": false,
        "request_id": request_id,
        "status": RequestStatus::from_error(err),
        "error": err.to_string(),
        "retryable": err.is_retryable(),
    });
    if let CoreError::Blackout { retry_after } = err {
        body["retry_after_ms"] = json!(retry_after.as_millis() as u64);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generate_line() {
        let msg: Inbound = serde_json::from_str(
            r#"{"type":"generate","personality":"Nova","user_id":"u1","persona_id":"p1",
                "conversation_id":"c1","content":"hello"}"#,
        )
        .unwrap();
        match msg {
            Inbound::Generate(req) => assert_eq!(req.content, "hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_config_write_line() {
        let msg: Inbound = serde_json::from_str(
            r#"{"type":"config_write","layer":{"channel":"c1"},"values":{"extended_context":null}}"#,
        )
        .unwrap();
        match msg {
            Inbound::ConfigWrite { layer, values } => {
                assert_eq!(layer, LayerKey::Channel("c1".into()));
                assert!(!values.extended_context.is_inherit());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failure_body_for_blackout() {
        let err = CoreError::Blackout {
            retry_after: std::time::Duration::from_millis(1500),
        };
        let body = failure("r1", &err);
        assert_eq!(body["status"], "rate_limited");
        assert_eq!(body["retry_after_ms"], 1500);
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn test_local_write_produces_invalidation_line() {
        use chorus_core::events::InvalidationEvent;
        use std::sync::{Arc, Mutex};
        use tokio_util::sync::CancellationToken;

        let bus = InvalidationBus::new(8);
        let lines = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();
        let sink = Arc::clone(&lines);
        let relay = bus.spawn_relay(
            move |wire| sink.lock().unwrap().push(invalidation_line(&wire)),
            shutdown.clone(),
        );

        bus.publish(InvalidationEvent::entity(
            chorus_core::events::EntityKind::Personality,
            "nova",
        ));
        while lines.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        relay.await.unwrap();

        let line = lines.lock().unwrap()[0].clone();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "invalidation");
        assert_eq!(value["payload"]["kind"], "personality");
        assert_eq!(value["payload"]["id"], "nova");

        // A peer reading the line relays it locally.
        match serde_json::from_str::<Inbound>(&line).unwrap() {
            Inbound::Invalidate { payload } => {
                let mut rx = bus.subscribe();
                assert_eq!(bus.relay_inbound(&payload.to_string()).unwrap(), 1);
                assert_eq!(
                    rx.recv().await.unwrap(),
                    InvalidationEvent::entity(chorus_core::events::EntityKind::Personality, "nova")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
