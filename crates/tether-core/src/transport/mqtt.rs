//! MQTT broker binding
//!
//! Connects to the broker named by `broker_url` (`mqtt://`, `mqtts://`,
//! `ws://` or `wss://`) with this client's host name as username and the
//! broker secret as password. A single event-loop task feeds every
//! subscription and re-subscribes after a reconnect.
//!
//! MQTT gives no view of other subscribers, so `has_route` is always false:
//! a peer only publishes to a remote host once that host has reached it
//! over the broker, and uses the HTTP fallback until then.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, BrokerMessage, topic_matches};
use crate::config::TetherConfig;
use crate::error::{Result, TetherError};
use crate::host::normalize_host;
use crate::id::generate_id;

/// How long `connect` waits for the broker's CONNACK
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between reconnect attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Requests buffered between the client handle and the event loop
const REQUEST_CAPACITY: usize = 256;
/// Largest packet accepted or sent
const MAX_PACKET: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

/// Where the broker lives, parsed from `broker_url`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub scheme: BrokerScheme,
    pub host: String,
    pub port: u16,
    /// Full url for websocket transports
    pub url: String,
}

impl BrokerEndpoint {
    pub fn parse(broker_url: &str) -> Result<Self> {
        let url = reqwest::Url::parse(broker_url.trim())
            .map_err(|e| TetherError::ConfigError(format!("broker_url {}: {}", broker_url, e)))?;
        let (scheme, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (BrokerScheme::Tcp, 1883),
            "mqtts" | "ssl" => (BrokerScheme::Tls, 8883),
            "ws" => (BrokerScheme::Ws, 80),
            "wss" => (BrokerScheme::Wss, 443),
            other => {
                return Err(TetherError::ConfigError(format!(
                    "unsupported broker scheme {}",
                    other
                )));
            }
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| TetherError::ConfigError(format!("broker_url {} has no host", broker_url)))?
            .to_string();
        let port = url.port().unwrap_or(default_port);
        Ok(Self {
            scheme,
            host,
            port,
            url: url.to_string(),
        })
    }

    /// Host argument for the MQTT options; websockets take the whole url
    fn options_host(&self) -> &str {
        match self.scheme {
            BrokerScheme::Ws | BrokerScheme::Wss => &self.url,
            BrokerScheme::Tcp | BrokerScheme::Tls => &self.host,
        }
    }

    fn transport(&self) -> Transport {
        match self.scheme {
            BrokerScheme::Tcp => Transport::Tcp,
            BrokerScheme::Tls => Transport::tls_with_default_config(),
            BrokerScheme::Ws => Transport::Ws,
            BrokerScheme::Wss => Transport::wss_with_default_config(),
        }
    }
}

fn mqtt_options(config: &TetherConfig) -> Result<MqttOptions> {
    let endpoint = BrokerEndpoint::parse(&config.broker_url)?;
    let username = normalize_host(&config.host_name);
    let client_id = format!("{}-{}", username, generate_id());

    let mut options = MqttOptions::new(client_id, endpoint.options_host(), endpoint.port);
    options.set_transport(endpoint.transport());
    options.set_keep_alive(Duration::from_secs(config.keepalive_secs.max(5)));
    options.set_clean_session(true);
    options.set_max_packet_size(MAX_PACKET, MAX_PACKET);
    options.set_credentials(username, config.broker_secret.clone().unwrap_or_default());
    Ok(options)
}

struct Route {
    filter: String,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

type Routes = Arc<Mutex<Vec<Route>>>;

fn lock(routes: &Routes) -> std::sync::MutexGuard<'_, Vec<Route>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A client's connection to an MQTT broker
pub struct MqttBroker {
    client: AsyncClient,
    username: String,
    routes: Routes,
    connected: Arc<AtomicBool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBroker {
    /// Connects with the broker settings of `config` and waits for the CONNACK
    pub async fn connect(config: &TetherConfig) -> Result<Self> {
        let options = mqtt_options(config)?;
        let username = normalize_host(&config.host_name);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let routes: Routes = Arc::default();
        let connected = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        info!("Connecting to broker {} as {}", config.broker_url, username);
        let task = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            routes.clone(),
            connected.clone(),
            ready_tx,
        ));

        let outcome = match tokio::time::timeout(CONNECT_TIMEOUT, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TetherError::BrokerDisconnected),
            Err(_) => Err(TetherError::Broker(format!(
                "no answer from {} within {:?}",
                config.broker_url, CONNECT_TIMEOUT
            ))),
        };
        if let Err(e) = outcome {
            task.abort();
            return Err(e);
        }

        Ok(Self {
            client,
            username,
            routes,
            connected,
            event_loop: Mutex::new(Some(task)),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    routes: Routes,
    connected: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready);
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::SeqCst);
                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Ok(()));
                    }
                    None => resubscribe(&client, &routes),
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                deliver(&routes, publish.topic, publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(TetherError::Broker(e.to_string())));
                    return;
                }
                if let ConnectionError::ConnectionRefused(code) = e {
                    error!("Broker refused the connection: {:?}", code);
                    return;
                }
                warn!("Broker connection lost: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn deliver(routes: &Routes, topic: String, payload: Bytes) {
    let mut routes = lock(routes);
    routes.retain(|route| !route.tx.is_closed());
    for route in routes.iter().filter(|route| topic_matches(&route.filter, &topic)) {
        let _ = route.tx.send(BrokerMessage {
            topic: topic.clone(),
            payload: payload.clone(),
        });
    }
}

fn resubscribe(client: &AsyncClient, routes: &Routes) {
    let mut filters: Vec<String> = lock(routes).iter().map(|r| r.filter.clone()).collect();
    filters.sort();
    filters.dedup();
    for filter in filters {
        debug!("Re-subscribing to {}", filter);
        if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
            warn!("Could not re-subscribe to {}: {}", filter, e);
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TetherError::BrokerDisconnected);
        }
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| TetherError::Broker(e.to_string()))
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::UnboundedReceiver<BrokerMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.routes).push(Route {
            filter: filter.to_string(),
            tx,
        });
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| TetherError::Broker(e.to_string()))?;
        debug!("{} subscribed to {}", self.username, filter);
        Ok(rx)
    }

    fn has_route(&self, _topic: &str) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.client.disconnect().await {
                debug!("Broker disconnect: {}", e);
            }
            info!("{} disconnected from broker", self.username);
        }
        let task = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        lock(&self.routes).clear();
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        if let Some(task) = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_urls() {
        let wss = BrokerEndpoint::parse("wss://Broker.Example.com/_hs/ws").unwrap();
        assert_eq!(wss.scheme, BrokerScheme::Wss);
        assert_eq!(wss.host, "broker.example.com");
        assert_eq!(wss.port, 443);
        assert_eq!(wss.options_host(), "wss://broker.example.com/_hs/ws");

        let tcp = BrokerEndpoint::parse("mqtt://127.0.0.1:1884").unwrap();
        assert_eq!(tcp.scheme, BrokerScheme::Tcp);
        assert_eq!(tcp.port, 1884);
        assert_eq!(tcp.options_host(), "127.0.0.1");

        assert_eq!(BrokerEndpoint::parse("mqtts://broker.example.com").unwrap().port, 8883);
        assert_eq!(BrokerEndpoint::parse("ws://broker.example.com:9001/mqtt").unwrap().port, 9001);
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(matches!(
            BrokerEndpoint::parse("http://broker.example.com"),
            Err(TetherError::ConfigError(_))
        ));
        assert!(BrokerEndpoint::parse("not a url").is_err());
    }

    #[tokio::test]
    async fn test_connect_fails_without_broker() {
        // nothing listens on the discard port
        let config = TetherConfig::new()
            .with_host_name("alice.test")
            .with_broker_url("mqtt://127.0.0.1:9");
        let result = MqttBroker::connect(&config).await;
        assert!(matches!(result, Err(TetherError::Broker(_))));
    }
}
