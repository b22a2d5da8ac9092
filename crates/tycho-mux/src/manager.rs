//! Client pool keyed by host id.
//!
//! # Design notes
//! One client per host, built lazily. The pool lock is held across dial and
//! login so concurrent callers for the same host never race two links into
//! existence; a stale client (link lost) is rebuilt in place.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use tycho_client::{Client, Credentials, TlsConfig};
use tycho_transport::ConnectOptions;
use tycho_wire::Encoding;

use crate::config::{HostConfig, MuxConfig, SecureStore};

pub struct ConnectionManager {
    config: MuxConfig,
    secure: SecureStore,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl ConnectionManager {
    /// Validate the configuration and build an empty pool.
    pub fn new(config: MuxConfig, secure: SecureStore) -> Result<Self> {
        config.validate().map_err(|errors| anyhow!("{errors}"))?;
        Ok(Self {
            config,
            secure,
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Client for `host_id` with an open link, reusing the pooled one when
    /// it is still connected.
    pub async fn get_client(&self, host_id: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().await;

        if let Some(client) = clients.get(host_id) {
            if client.is_link_open() {
                return Ok(Arc::clone(client));
            }
            debug!(host = host_id, "pooled client lost its link, rebuilding");
            clients.remove(host_id);
        }

        let Some(host) = self.config.hosts.get(host_id) else {
            bail!("unknown host {host_id:?}");
        };
        let client = Arc::new(self.build_client(host_id, host)?);
        client
            .login()
            .await
            .with_context(|| format!("login to host {host_id} failed"))?;
        client
            .establish_link()
            .await
            .with_context(|| format!("link to host {host_id} failed"))?;

        clients.insert(host_id.to_string(), Arc::clone(&client));
        Ok(client)
    }

    fn build_client(&self, host_id: &str, host: &HostConfig) -> Result<Client> {
        let tls = if host.tls {
            TlsConfig::enabled(!host.tls_insecure, host.ca_path.clone())
        } else {
            TlsConfig::disabled()
        };
        let credentials = if host.auth {
            let Some(password) = self.secure.password_for(host_id) else {
                bail!("host {host_id}: no password in secure store");
            };
            Credentials::Basic {
                username: host.username.clone(),
                password: password.to_string(),
            }
        } else {
            Credentials::None
        };
        let encoding = if host.binary {
            Encoding::Binary
        } else {
            Encoding::Json
        };
        Client::new(
            &host.address,
            &tls,
            Arc::new(credentials),
            encoding,
            ConnectOptions::default(),
        )
    }

    /// Close every pooled link and empty the pool.
    pub async fn dispose(&self) {
        let mut clients = self.clients.lock().await;
        for (host_id, client) in clients.drain() {
            if let Err(err) = client.close_link().await {
                warn!(host = %host_id, error = %err, "close during dispose failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn config_for(address: &str) -> MuxConfig {
        let mut config = MuxConfig::default();
        config.hosts.insert(
            "ops".to_string(),
            HostConfig {
                name: "Operations".to_string(),
                address: address.to_string(),
                ..HostConfig::default()
            },
        );
        config.endpoints.insert(
            "sim-rt".to_string(),
            EndpointConfig {
                name: "Simulator".to_string(),
                host: "ops".to_string(),
                instance: "simulator".to_string(),
                processor: "realtime".to_string(),
                ..EndpointConfig::default()
            },
        );
        config
    }

    // Accepts websocket upgrades forever, answering pings only.
    async fn spawn_idle_server() -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let accepts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&accepts);
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.expect("accept");
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut ws = crate::test_ws::accept(stream).await;
                    while let Some(Ok(message)) = ws.next().await {
                        if let Message::Ping(payload) = message {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                    }
                });
            }
        });
        (addr, accepts)
    }

    #[tokio::test]
    async fn pooled_client_is_reused_while_link_is_open() {
        let (address, accepts) = spawn_idle_server().await;
        let manager =
            ConnectionManager::new(config_for(&address), SecureStore::default()).expect("manager");

        let first = manager.get_client("ops").await.expect("client");
        let second = manager.get_client("ops").await.expect("client");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_client_is_rebuilt() {
        let (address, accepts) = spawn_idle_server().await;
        let manager =
            ConnectionManager::new(config_for(&address), SecureStore::default()).expect("manager");

        let first = manager.get_client("ops").await.expect("client");
        first.close_link().await.expect("close");
        let second = manager.get_client("ops").await.expect("client");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_link_open());
        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_host_is_an_error() {
        let (address, _) = spawn_idle_server().await;
        let manager =
            ConnectionManager::new(config_for(&address), SecureStore::default()).expect("manager");
        let error = manager.get_client("nope").await.err().expect("unknown");
        assert!(error.to_string().contains("unknown host"));
    }

    #[tokio::test]
    async fn missing_password_is_an_error() {
        let (address, _) = spawn_idle_server().await;
        let mut config = config_for(&address);
        let host = config.hosts.get_mut("ops").expect("host");
        host.auth = true;
        host.username = "flight".to_string();
        let manager = ConnectionManager::new(config, SecureStore::default()).expect("manager");
        let error = manager.get_client("ops").await.err().expect("no password");
        assert!(error.to_string().contains("secure store"));
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let error = ConnectionManager::new(MuxConfig::default(), SecureStore::default())
            .err()
            .expect("invalid");
        assert!(error.to_string().contains("invalid configuration"));
    }
}
