//! SDP exchange: how local and remote session descriptions reach each
//! other before connectivity checks.
//!
//! Two transports are supported. HTTP long-poll goes through the
//! [`HttpClient`] seam. MQTT pub/sub goes through a host-supplied
//! [`MqttClient`], since the broker connection is owned by the host.

use async_trait::async_trait;
use log::{debug, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use vipcore::net::{HttpClient, HttpRequest};
use vipcore::p2p::{HttpAuth, IceRole, SdpTransport, SessionDescription};

use crate::error::TunnelError;

/// The rendezvous refused our credentials (HTTP 401 or 403).
#[derive(Debug, thiserror::Error)]
#[error("rendezvous rejected the credentials")]
pub struct Unauthorized;

fn rejected(status: u16, what: &str) -> anyhow::Error {
    match status {
        401 | 403 => Unauthorized.into(),
        _ => anyhow::anyhow!("SDP {what} failed with status {status}"),
    }
}

#[async_trait]
pub trait SdpExchange: Send + Sync {
    /// Publishes our description to the peer.
    async fn publish(&self, local: &SessionDescription) -> Result<(), anyhow::Error>;

    /// Waits for the peer's description.
    async fn receive(&self) -> Result<SessionDescription, anyhow::Error>;
}

/// Minimal MQTT surface the exchange needs.
#[async_trait]
pub trait MqttClient: Send + Sync {
    async fn connect(
        &self,
        broker: &str,
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), anyhow::Error>;

    /// Subscribes to `topic`; payloads arrive on the returned channel.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, anyhow::Error>;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), anyhow::Error>;
}

fn role_path(role: IceRole) -> &'static str {
    match role {
        IceRole::Controlling => "offer",
        IceRole::Controlled => "answer",
    }
}

/// Long-poll exchange against an HTTP rendezvous endpoint.
///
/// Our description is POSTed to `{endpoint}/{session}/{offer|answer}`; the
/// peer's is fetched with GET on the opposite path, where `204 No Content`
/// means "not yet, poll again".
pub struct HttpSdpExchange {
    client: Arc<dyn HttpClient>,
    endpoint: String,
    auth: HttpAuth,
    poll_timeout: Duration,
    session: String,
    role: IceRole,
}

impl HttpSdpExchange {
    pub fn new(
        client: Arc<dyn HttpClient>,
        endpoint: impl Into<String>,
        auth: HttpAuth,
        poll_timeout: Duration,
        session: &str,
        role: IceRole,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            auth,
            poll_timeout,
            session: urlencoding::encode(session).into_owned(),
            role,
        }
    }

    fn url(&self, role: IceRole) -> String {
        format!("{}/{}/{}", self.endpoint, self.session, role_path(role))
    }

    fn authorize(&self, request: HttpRequest) -> HttpRequest {
        match &self.auth {
            HttpAuth::Bearer(token) => request.with_header("Authorization", format!("Bearer {token}")),
            HttpAuth::ActivationCode(code) => request.with_header("X-Activation-Code", code),
        }
    }
}

#[async_trait]
impl SdpExchange for HttpSdpExchange {
    async fn publish(&self, local: &SessionDescription) -> Result<(), anyhow::Error> {
        let body = serde_json::to_vec(local)?;
        let request = self.authorize(
            HttpRequest::post(self.url(self.role)).with_json(body),
        );
        let response = self.client.execute(request).await?;
        if !response.is_success() {
            return Err(rejected(response.status_code, "publish"));
        }
        debug!(target: "Tunnel/Signaling", "Published {} via HTTP", role_path(self.role));
        Ok(())
    }

    async fn receive(&self) -> Result<SessionDescription, anyhow::Error> {
        let url = format!(
            "{}?wait={}",
            self.url(self.role.opposite()),
            self.poll_timeout.as_secs()
        );
        loop {
            let request = self.authorize(HttpRequest::get(&url).with_timeout(self.poll_timeout));
            let response = self.client.execute(request).await?;
            if response.is_empty_poll() {
                trace!(target: "Tunnel/Signaling", "No remote description yet, polling again");
                continue;
            }
            if !response.is_success() {
                return Err(rejected(response.status_code, "poll"));
            }
            return Ok(serde_json::from_slice(&response.body)?);
        }
    }
}

/// Exchange over two MQTT topics: we publish on ours and listen on the
/// peer's.
pub struct MqttSdpExchange {
    client: Arc<dyn MqttClient>,
    local_topic: String,
    inbox: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl MqttSdpExchange {
    /// Connects to the broker and subscribes to the remote topic before
    /// anything is published, so the peer's answer cannot be missed.
    pub async fn connect(
        client: Arc<dyn MqttClient>,
        transport: &SdpTransport,
    ) -> Result<Self, TunnelError> {
        let SdpTransport::Mqtt {
            broker,
            client_id,
            username,
            password,
            local_topic,
            remote_topic,
        } = transport
        else {
            return Err(TunnelError::Signaling("not an MQTT transport".into()));
        };
        client
            .connect(broker, client_id, username.as_deref(), password.as_deref())
            .await
            .map_err(|e| TunnelError::Signaling(e.to_string()))?;
        let inbox = client
            .subscribe(remote_topic)
            .await
            .map_err(|e| TunnelError::Signaling(e.to_string()))?;
        debug!(target: "Tunnel/Signaling", "Subscribed to {remote_topic} on {broker}");
        Ok(Self {
            client,
            local_topic: local_topic.clone(),
            inbox: Mutex::new(inbox),
        })
    }
}

#[async_trait]
impl SdpExchange for MqttSdpExchange {
    async fn publish(&self, local: &SessionDescription) -> Result<(), anyhow::Error> {
        let payload = serde_json::to_vec(local)?;
        self.client.publish(&self.local_topic, &payload).await
    }

    async fn receive(&self) -> Result<SessionDescription, anyhow::Error> {
        let mut inbox = self.inbox.lock().await;
        loop {
            let payload = inbox
                .recv()
                .await
                .ok_or_else(|| anyhow::anyhow!("MQTT subscription closed"))?;
            match serde_json::from_slice(&payload) {
                Ok(description) => return Ok(description),
                // Other traffic can share the topic.
                Err(e) => debug!(target: "Tunnel/Signaling", "Skipping non-SDP payload: {e}"),
            }
        }
    }
}

/// Builds the exchange for the configured transport. MQTT needs a host
/// client; without one the configuration cannot be served.
pub async fn exchange_for(
    transport: &SdpTransport,
    role: IceRole,
    session: &str,
    http: Arc<dyn HttpClient>,
    mqtt: Option<Arc<dyn MqttClient>>,
) -> Result<Arc<dyn SdpExchange>, TunnelError> {
    match transport {
        SdpTransport::Http {
            endpoint,
            auth,
            poll_timeout,
        } => Ok(Arc::new(HttpSdpExchange::new(
            http,
            endpoint.clone(),
            auth.clone(),
            *poll_timeout,
            session,
            role,
        ))),
        SdpTransport::Mqtt { .. } => {
            let client = mqtt.ok_or_else(|| {
                TunnelError::Signaling("MQTT transport configured without a client".into())
            })?;
            Ok(Arc::new(MqttSdpExchange::connect(client, transport).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use vipcore::net::{HttpMethod, HttpResponse};
    use vipcore::p2p::Candidate;

    fn description(role: IceRole) -> SessionDescription {
        SessionDescription {
            ufrag: "abcd".into(),
            pwd: "0123456789abcdefghijkl".into(),
            role,
            candidates: vec![Candidate::host("192.168.1.20:40000".parse().unwrap())],
        }
    }

    /// Answers every request from a script and records what was asked.
    struct ScriptedHttp {
        requests: StdMutex<Vec<HttpRequest>>,
        responses: StdMutex<Vec<HttpResponse>>,
    }

    #[async_trait]
    impl HttpClient for ScriptedHttp {
        async fn execute(&self, request: HttpRequest) -> Result<vipcore::net::HttpResponse, anyhow::Error> {
            self.requests.lock().unwrap().push(request);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(anyhow::anyhow!("script exhausted"));
            }
            Ok(responses.remove(0))
        }
    }

    #[tokio::test]
    async fn test_http_exchange_polls_until_answer() {
        let answer = description(IceRole::Controlled);
        let http = Arc::new(ScriptedHttp {
            requests: StdMutex::new(Vec::new()),
            responses: StdMutex::new(vec![
                HttpResponse { status_code: 201, body: Vec::new() },
                HttpResponse { status_code: 204, body: Vec::new() },
                HttpResponse { status_code: 200, body: serde_json::to_vec(&answer).unwrap() },
            ]),
        });
        let exchange = HttpSdpExchange::new(
            http.clone(),
            "https://p2p.example.net/sdp/",
            HttpAuth::Bearer("tok".into()),
            Duration::from_secs(25),
            "unit 00010002",
            IceRole::Controlling,
        );

        exchange.publish(&description(IceRole::Controlling)).await.unwrap();
        assert_eq!(exchange.receive().await.unwrap(), answer);

        let requests = http.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].method, HttpMethod::Post);
        assert_eq!(requests[0].url, "https://p2p.example.net/sdp/unit%2000010002/offer");
        assert_eq!(
            requests[0].headers.get("Authorization").map(String::as_str),
            Some("Bearer tok")
        );
        assert_eq!(
            requests[2].url,
            "https://p2p.example.net/sdp/unit%2000010002/answer?wait=25"
        );
    }

    #[tokio::test]
    async fn test_http_exchange_surfaces_rejection() {
        let http = Arc::new(ScriptedHttp {
            requests: StdMutex::new(Vec::new()),
            responses: StdMutex::new(vec![HttpResponse { status_code: 403, body: Vec::new() }]),
        });
        let exchange = HttpSdpExchange::new(
            http,
            "https://p2p.example.net/sdp",
            HttpAuth::ActivationCode("code".into()),
            Duration::from_secs(5),
            "s",
            IceRole::Controlled,
        );
        let err = exchange
            .publish(&description(IceRole::Controlled))
            .await
            .unwrap_err();
        assert!(err.is::<Unauthorized>());
    }

    #[derive(Default)]
    struct LoopbackMqtt {
        subscribers: StdMutex<Vec<(String, mpsc::Sender<Vec<u8>>)>>,
    }

    #[async_trait]
    impl MqttClient for LoopbackMqtt {
        async fn connect(
            &self,
            _broker: &str,
            _client_id: &str,
            _username: Option<&str>,
            _password: Option<&str>,
        ) -> Result<(), anyhow::Error> {
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, anyhow::Error> {
            let (tx, rx) = mpsc::channel(8);
            self.subscribers.lock().unwrap().push((topic.to_string(), tx));
            Ok(rx)
        }

        async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), anyhow::Error> {
            let targets: Vec<_> = self
                .subscribers
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, tx)| tx.clone())
                .collect();
            for tx in targets {
                tx.send(payload.to_vec()).await?;
            }
            Ok(())
        }
    }

    fn mqtt(local: &str, remote: &str) -> SdpTransport {
        SdpTransport::Mqtt {
            broker: "mqtt://broker".into(),
            client_id: local.into(),
            username: None,
            password: None,
            local_topic: local.into(),
            remote_topic: remote.into(),
        }
    }

    #[tokio::test]
    async fn test_mqtt_exchange_skips_noise() {
        let broker: Arc<dyn MqttClient> = Arc::new(LoopbackMqtt::default());
        let app = MqttSdpExchange::connect(broker.clone(), &mqtt("app", "unit"))
            .await
            .unwrap();
        let unit = MqttSdpExchange::connect(broker.clone(), &mqtt("unit", "app"))
            .await
            .unwrap();

        broker.publish("unit", b"not json").await.unwrap();
        unit.publish(&description(IceRole::Controlled)).await.unwrap();
        assert_eq!(app.receive().await.unwrap().role, IceRole::Controlled);
    }

    #[tokio::test]
    async fn test_mqtt_requires_client() {
        let http: Arc<dyn HttpClient> = Arc::new(ScriptedHttp {
            requests: StdMutex::new(Vec::new()),
            responses: StdMutex::new(Vec::new()),
        });
        let result = exchange_for(&mqtt("a", "b"), IceRole::Controlling, "s", http, None).await;
        assert!(matches!(result, Err(TunnelError::Signaling(_))));
    }
}
