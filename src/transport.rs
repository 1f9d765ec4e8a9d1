//! Delivery of federated commands to party instances.
//!
//! The coordinator only sees the [`PartyTransport`] trait. `LocalTransport`
//! routes to in-process handlers (tests, single-process multi-party
//! deployments); `HttpTransport` posts the JSON envelope to the remote
//! party's command endpoint.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::dag::PartyAddr;
use crate::federation::{Command, CommandEnvelope, PartyReply};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no route to party {0}")]
    Unroutable(PartyAddr),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("party {party} answered {status}")]
    Remote {
        party: PartyAddr,
        status: reqwest::StatusCode,
    },
}

/// Sends one command to one destination party.
#[async_trait]
pub trait PartyTransport: Send + Sync {
    async fn send(&self, dest: &PartyAddr, command: &Command) -> Result<PartyReply, TransportError>;
}

/// Processes commands addressed to one party instance.
///
/// Implemented by the party controller; the handler never fails at the
/// transport level — application problems are encoded in the reply code.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, dest: &PartyAddr, command: &Command) -> PartyReply;
}

/// In-process transport: a registry of handlers keyed by party id. One
/// handler serves every role its party fills.
#[derive(Default)]
pub struct LocalTransport {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, party_id: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers
            .write()
            .expect("transport registry poisoned")
            .insert(party_id.into(), handler);
    }

    pub fn deregister(&self, party_id: &str) {
        self.handlers
            .write()
            .expect("transport registry poisoned")
            .remove(party_id);
    }

    fn handler(&self, party_id: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers
            .read()
            .expect("transport registry poisoned")
            .get(party_id)
            .cloned()
    }
}

#[async_trait]
impl PartyTransport for LocalTransport {
    async fn send(&self, dest: &PartyAddr, command: &Command) -> Result<PartyReply, TransportError> {
        let handler = self
            .handler(&dest.party_id)
            .ok_or_else(|| TransportError::Unroutable(dest.clone()))?;
        Ok(handler.handle(dest, command).await)
    }
}

/// HTTP transport: posts the command envelope to each party's federated
/// endpoint, resolved through a static route table.
pub struct HttpTransport {
    client: reqwest::Client,
    /// party_id -> base URL, e.g. "http://10.0.0.7:9380".
    routes: HashMap<String, String>,
}

impl HttpTransport {
    pub fn new(routes: HashMap<String, String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, routes })
    }
}

#[async_trait]
impl PartyTransport for HttpTransport {
    async fn send(&self, dest: &PartyAddr, command: &Command) -> Result<PartyReply, TransportError> {
        let base = self
            .routes
            .get(&dest.party_id)
            .ok_or_else(|| TransportError::Unroutable(dest.clone()))?;
        let envelope = CommandEnvelope {
            dest: dest.clone(),
            command: command.clone(),
        };
        let response = self
            .client
            .post(format!("{}/v1/federated/command", base.trim_end_matches('/')))
            .json(&envelope)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Remote {
                party: dest.clone(),
                status: response.status(),
            });
        }
        Ok(response.json::<PartyReply>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, dest: &PartyAddr, command: &Command) -> PartyReply {
            PartyReply::success(serde_json::json!({
                "role": dest.role,
                "op": command.op(),
            }))
        }
    }

    #[tokio::test]
    async fn local_transport_routes_by_party_id() {
        let transport = LocalTransport::new();
        transport.register("9999", Arc::new(EchoHandler));

        let reply = transport
            .send(
                &PartyAddr::new("guest", "9999"),
                &Command::JobStart { job_id: "j-1".into() },
            )
            .await
            .unwrap();
        assert_eq!(reply.data["op"], Value::from("job.start"));
        assert_eq!(reply.data["role"], Value::from("guest"));

        let missing = transport
            .send(
                &PartyAddr::new("host", "10000"),
                &Command::JobStart { job_id: "j-1".into() },
            )
            .await;
        assert!(matches!(missing, Err(TransportError::Unroutable(_))));
    }
}
