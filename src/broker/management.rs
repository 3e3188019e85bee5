//! RabbitMQ transport over the management HTTP API.
//!
//! Every operation is a plain HTTP request against the management plugin
//! (port 15672 by default). Delivery is at-most-once: the API settles a
//! message when it is fetched, so [`Broker::ack`] has nothing left to do and a
//! failing handler loses its message. Use [`RabbitMqBroker`](super::RabbitMqBroker)
//! when unacknowledged messages must be redelivered.

use super::{Broker, BrokerError, Delivery};
use crate::configuration::SimulationConfig;
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Response, StatusCode};
use serde_derive::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub struct ManagementApiBroker {
    client: Client,
    endpoint: String,
    username: String,
    password: String,
    vhost: String,
    connected: AtomicBool,
    next_tag: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    routed: bool,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    payload: String,
    payload_encoding: String,
    #[serde(default)]
    redelivered: bool,
}

#[derive(Debug, Deserialize)]
struct QueueInfo {
    #[serde(default)]
    messages_ready: u32,
}

impl ManagementApiBroker {
    pub fn new(config: &SimulationConfig) -> Self {
        Self::with_endpoint(
            config.management_endpoint(),
            &config.username,
            &config.password,
            &config.vhost,
        )
    }

    pub fn with_endpoint(
        endpoint: impl Into<String>,
        username: &str,
        password: &str,
        vhost: &str,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            vhost: vhost.to_string(),
            connected: AtomicBool::new(false),
            next_tag: AtomicU64::new(0),
        }
    }

    fn queue_url(&self, queue: &str) -> String {
        format!(
            "{}/api/queues/{}/{}",
            self.endpoint,
            urlencoded(&self.vhost),
            urlencoded(queue)
        )
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, BrokerError> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response, BrokerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let reason = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
            BrokerError::InvalidArgument(format!("{status}: {reason}"))
        }
        StatusCode::UNAUTHORIZED => BrokerError::Unreachable("invalid credentials".to_string()),
        _ => BrokerError::Transport(format!("{status}: {reason}")),
    })
}

#[async_trait]
impl Broker for ManagementApiBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let url = format!("{}/api/overview", self.endpoint);
        self.client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| BrokerError::Unreachable(e.to_string()))
            .and_then(|response| match response.status() {
                s if s.is_success() => Ok(()),
                StatusCode::UNAUTHORIZED => {
                    Err(BrokerError::Unreachable("invalid credentials".to_string()))
                }
                s => Err(BrokerError::Unreachable(format!("management API returned {s}"))),
            })?;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let request = self.client.put(self.queue_url(queue)).json(&json!({
            "durable": false,
            "auto_delete": false,
            "arguments": {}
        }));
        self.send(request).await?;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let (payload, payload_encoding) = match std::str::from_utf8(body) {
            Ok(text) => (text.to_string(), "string"),
            Err(_) => (
                base64::engine::general_purpose::STANDARD.encode(body),
                "base64",
            ),
        };
        let url = format!(
            "{}/api/exchanges/{}/amq.default/publish",
            self.endpoint,
            urlencoded(&self.vhost)
        );
        let request = self.client.post(&url).json(&json!({
            "properties": { "content_type": content_type },
            "routing_key": queue,
            "payload": payload,
            "payload_encoding": payload_encoding
        }));
        let response: PublishResponse = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        if !response.routed {
            return Err(BrokerError::InvalidArgument(format!(
                "message was not routed to queue '{queue}'"
            )));
        }
        Ok(())
    }

    async fn poll(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_connected()?;
        let request = self
            .client
            .post(format!("{}/get", self.queue_url(queue)))
            .json(&json!({
                "count": 1,
                "ackmode": "ack_requeue_false",
                "encoding": "auto"
            }));
        let messages: Vec<GetResponse> = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let Some(message) = messages.into_iter().next() else {
            return Ok(None);
        };
        let body = match message.payload_encoding.as_str() {
            "base64" => base64::engine::general_purpose::STANDARD
                .decode(message.payload)
                .map_err(|e| BrokerError::Transport(format!("bad base64 payload: {e}")))?,
            _ => message.payload.into_bytes(),
        };
        Ok(Some(Delivery {
            delivery_tag: self.next_tag.fetch_add(1, Ordering::Relaxed) + 1,
            body,
            redelivered: message.redelivered,
        }))
    }

    async fn ack(&self, _delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_connected()
    }

    fn settles_on_fetch(&self) -> bool {
        true
    }

    async fn purge(&self, queue: &str) -> Result<u32, BrokerError> {
        self.ensure_connected()?;
        let info: QueueInfo = self
            .send(self.client.get(self.queue_url(queue)))
            .await?
            .json()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        self.send(self.client.delete(format!("{}/contents", self.queue_url(queue))))
            .await?;
        Ok(info.messages_ready)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

fn urlencoded(s: &str) -> String {
    s.replace('/', "%2F")
}
