//! Subscription wiring and JSON line output.

use nimbus_realtime::{
    PresenceUser, RealtimeClient, RealtimeError, Subscription, TableSubscription,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

/// What to tail.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    pub tables: Vec<String>,
    pub channels: Vec<String>,
    pub presence: Vec<String>,
    pub workflows: Vec<String>,
    /// Identity announced when joining presence channels.
    pub user_id: String,
}

impl Targets {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
            && self.channels.is_empty()
            && self.presence.is_empty()
            && self.workflows.is_empty()
    }
}

/// Something for the printer.
#[derive(Debug)]
pub enum Output {
    Line(Value),
    /// The client gave up; tailing cannot continue.
    Fatal(String),
}

fn line(kind: &str, target: &str, event: &impl Serialize) -> Option<Output> {
    match serde_json::to_value(event) {
        Ok(event) => Some(Output::Line(json!({
            "kind": kind,
            "target": target,
            "event": event,
        }))),
        Err(err) => {
            warn!(kind, target, error = %err, "Dropping unserializable event");
            None
        }
    }
}

fn forward(out: &UnboundedSender<Output>, output: Option<Output>) {
    if let Some(output) = output {
        let _ = out.send(output);
    }
}

/// Report connection state changes and errors as lines.
pub fn watch(client: &RealtimeClient, out: UnboundedSender<Output>) {
    let states = out.clone();
    client.on_connection_state_change(move |status| {
        forward(&states, line("state", status.state.as_str(), status));
    });

    client.on_error(move |err| match err {
        RealtimeError::ReconnectFailed { .. } => {
            let _ = out.send(Output::Fatal(err.to_string()));
        }
        other => forward(&out, line("error", "", &other.to_string())),
    });
}

/// Subscribe to every target; events are forwarded as lines.
///
/// # Errors
///
/// Stops at the first subscription the client refuses.
pub fn subscribe_all(
    client: &RealtimeClient,
    targets: &Targets,
    out: &UnboundedSender<Output>,
) -> Result<Vec<Subscription>, RealtimeError> {
    let mut subscriptions = Vec::new();

    for table in &targets.tables {
        let (out, name) = (out.clone(), table.clone());
        subscriptions.push(client.subscribe_to_table(
            TableSubscription::new(table.as_str()),
            move |change| forward(&out, line("database", &name, &change)),
        )?);
    }

    for channel in &targets.channels {
        let (out, name) = (out.clone(), channel.clone());
        subscriptions.push(client.subscribe_to_channel(channel, move |message| {
            forward(&out, line("channel", &name, &message));
        })?);
    }

    for channel in &targets.presence {
        let (out, name) = (out.clone(), channel.clone());
        subscriptions.push(client.subscribe_to_presence(
            channel,
            PresenceUser::new(targets.user_id.as_str()),
            move |diff| forward(&out, line("presence", &name, &diff)),
        )?);
    }

    for workflow in &targets.workflows {
        let (out, name) = (out.clone(), workflow.clone());
        subscriptions.push(client.subscribe_to_workflow(workflow, move |event| {
            forward(&out, line("workflow", &name, &event));
        })?);
    }

    Ok(subscriptions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_protocol::{ChangeType, DatabaseChange, ServerFrame};
    use nimbus_transport::MemoryConnector;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn targets() -> Targets {
        Targets {
            tables: vec!["orders".into()],
            channels: vec!["news".into()],
            presence: vec!["room".into()],
            workflows: vec!["wf-1".into()],
            user_id: "tail".into(),
        }
    }

    #[test]
    fn test_targets_is_empty() {
        assert!(Targets::default().is_empty());
        assert!(!targets().is_empty());
    }

    #[tokio::test]
    async fn test_events_become_lines() {
        let (connector, mut listener) = MemoryConnector::pair();
        let client = RealtimeClient::builder()
            .endpoint("memory://tail")
            .api_key("key")
            .connector(Arc::new(connector))
            .build()
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (result, peer) = tokio::join!(client.connect(), async {
            let peer = listener.accept().await.unwrap();
            peer.send(ServerFrame::connected("c1"));
            peer
        });
        result.unwrap();
        let mut peer = peer;

        let subscriptions = subscribe_all(&client, &targets(), &tx).unwrap();
        assert_eq!(subscriptions.len(), 4);
        for _ in 0..4 {
            peer.recv().await.unwrap();
        }

        peer.send(ServerFrame::DatabaseChange(DatabaseChange {
            change_type: ChangeType::Insert,
            table: "orders".into(),
            record: json!({ "id": 7 }),
            old_record: None,
        }));

        let Some(Output::Line(value)) = rx.recv().await else {
            panic!("expected a line");
        };
        assert_eq!(value["kind"], "database");
        assert_eq!(value["target"], "orders");
        assert_eq!(value["event"]["record"], json!({ "id": 7 }));
    }
}
