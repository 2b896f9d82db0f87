//! Fleet scheduler server
//!
//! Each client holds one TCP control session. On every tick the session
//! picks the next live relay, records the assignment in the `Clients`
//! keyspace (which relays consult to admit traffic) and tells the client to
//! switch. Relay choice uses one counter shared by all sessions, so N
//! clients spread over M relays with at most `ceil(N/M)` per relay in a
//! round.
//!
//! An assignment lives as long as some session from that client address is
//! open. It is deleted when the last such session ends, but kept across a
//! scheduler shutdown so relays keep admitting traffic meanwhile.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{encode_switch, read_line};
use crate::error::{RegistryError, SchedulerError};
use crate::registry::{live_relays, Keyspace, RelayRecord, Registry};

/// Default interval between assignments
pub const DEFAULT_SCHEDULE_INTERVAL: Duration = Duration::from_secs(5);

/// Default time a client has to acknowledge a switch
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Control session state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "relay", rename_all = "snake_case")]
pub enum SessionState {
    /// Connected, no assignment acknowledged yet
    Connected,
    /// Client acknowledged this relay
    Assigned(String),
    /// Switch command sent, waiting for the acknowledgement
    Reassigning(String),
}

/// Assigns clients to live relays and pushes switch commands
#[derive(Debug)]
pub struct FleetScheduler {
    registry: Arc<dyn Registry>,
    interval: Duration,
    ack_timeout: Duration,
    next: AtomicUsize,
    sessions: DashMap<SocketAddr, SessionState>,
}

impl FleetScheduler {
    /// Create a scheduler with the default interval and ack timeout
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            interval: DEFAULT_SCHEDULE_INTERVAL,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            next: AtomicUsize::new(0),
            sessions: DashMap::new(),
        }
    }

    /// Override the schedule interval
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Override the acknowledgement timeout
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Current state of every open session, keyed by peer address.
    ///
    /// A session is removed once it disconnects.
    pub fn sessions(&self) -> HashMap<SocketAddr, SessionState> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Pick the next relay from `relays` in round-robin order
    pub fn select_relay<'a>(&self, relays: &'a [RelayRecord]) -> Option<&'a RelayRecord> {
        if relays.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % relays.len();
        relays.get(index)
    }

    /// Choose and record the next assignment for `client`.
    ///
    /// Returns `Ok(None)` if no relay is live.
    ///
    /// # Errors
    ///
    /// Propagates registry failures.
    pub async fn assign(&self, client: IpAddr) -> Result<Option<String>, RegistryError> {
        let relays = live_relays(self.registry.as_ref()).await?;
        let Some(relay) = self.select_relay(&relays) else {
            return Ok(None);
        };
        self.registry
            .set(Keyspace::Clients, &client.to_string(), &relay.endpoint, None)
            .await?;
        debug!(
            client = %client,
            relay = %relay.name,
            endpoint = %relay.endpoint,
            "assigned relay"
        );
        Ok(Some(relay.endpoint.clone()))
    }

    /// Accept control sessions until `cancel` fires.
    ///
    /// Each session runs in its own task; a failing session does not affect
    /// the others.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        info!(local = ?listener.local_addr().ok(), "scheduler listening");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("scheduler shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let scheduler = Arc::clone(&self);
                            let cancel = cancel.child_token();
                            tokio::spawn(async move {
                                scheduler.serve(stream, peer, cancel).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "scheduler accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn serve(&self, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        info!(client = %peer.ip(), "control session opened");
        self.sessions.insert(peer, SessionState::Connected);

        match self.session(stream, peer, &cancel).await {
            Ok(()) => debug!(client = %peer.ip(), "control session cancelled"),
            Err(SchedulerError::Closed(_)) => info!(client = %peer.ip(), "client disconnected"),
            Err(e) => warn!(client = %peer.ip(), error = %e, "control session ended"),
        }

        self.sessions.remove(&peer);
        if !cancel.is_cancelled() {
            self.release(peer.ip()).await;
        }
    }

    /// Delete the assignment of `client` unless another session still serves it
    async fn release(&self, client: IpAddr) {
        if self.sessions.iter().any(|entry| entry.key().ip() == client) {
            return;
        }
        match self.registry.delete(Keyspace::Clients, &client.to_string()).await {
            Ok(true) => debug!(client = %client, "assignment released"),
            Ok(false) => {}
            Err(e) => warn!(client = %client, error = %e, "failed to release assignment"),
        }
    }

    async fn session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
                // Notice a disconnect between switches
                res = reader.fill_buf() => {
                    if res?.is_empty() {
                        return Err(SchedulerError::Closed(peer));
                    }
                    match read_line(&mut reader).await? {
                        Some(line) => {
                            debug!(client = %peer.ip(), line = %line, "ignoring unsolicited line");
                        }
                        None => return Err(SchedulerError::Closed(peer)),
                    }
                    continue;
                }
            }

            let endpoint = match self.assign(peer.ip()).await {
                Ok(Some(endpoint)) => endpoint,
                Ok(None) => {
                    debug!(client = %peer.ip(), "no live relays, skipping tick");
                    continue;
                }
                Err(e) => {
                    warn!(client = %peer.ip(), error = %e, "cannot read fleet, skipping tick");
                    continue;
                }
            };

            self.sessions.insert(peer, SessionState::Reassigning(endpoint.clone()));
            writer.write_all(encode_switch(&endpoint).as_bytes()).await?;
            writer.flush().await?;

            let ack = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                res = tokio::time::timeout(self.ack_timeout, read_line(&mut reader)) => {
                    res.map_err(|_| SchedulerError::AckTimeout(self.ack_timeout))??
                }
            };
            let Some(ack) = ack else {
                return Err(SchedulerError::Closed(peer));
            };
            if ack != endpoint {
                return Err(SchedulerError::AckMismatch {
                    sent: endpoint,
                    received: ack,
                });
            }

            debug!(client = %peer.ip(), endpoint = %endpoint, "switch acknowledged");
            self.sessions.insert(peer, SessionState::Assigned(endpoint));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn relays(names: &[&str]) -> Vec<RelayRecord> {
        names
            .iter()
            .map(|name| RelayRecord {
                name: (*name).to_string(),
                endpoint: format!("{name}:5114"),
            })
            .collect()
    }

    #[test]
    fn test_select_relay_round_robin() {
        let scheduler = FleetScheduler::new(Arc::new(MemoryRegistry::new()));
        let fleet = relays(&["relay-a", "relay-b", "relay-c"]);

        let picked: Vec<_> = (0..6)
            .map(|_| scheduler.select_relay(&fleet).unwrap().name.clone())
            .collect();
        assert_eq!(picked, ["relay-a", "relay-b", "relay-c", "relay-a", "relay-b", "relay-c"]);
        assert!(scheduler.select_relay(&[]).is_none());
    }

    #[tokio::test]
    async fn test_assign_writes_client_record() {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .set(Keyspace::Relays, "relay-a", "203.0.113.1:5114", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        let scheduler = FleetScheduler::new(registry.clone());

        let client: IpAddr = "7.0.0.2".parse().unwrap();
        assert_eq!(scheduler.assign(client).await.unwrap().as_deref(), Some("203.0.113.1:5114"));
        assert_eq!(
            registry.get(Keyspace::Clients, "7.0.0.2").await.unwrap().as_deref(),
            Some("203.0.113.1:5114")
        );
    }

    #[tokio::test]
    async fn test_assign_with_empty_fleet() {
        let scheduler = FleetScheduler::new(Arc::new(MemoryRegistry::new()));
        assert_eq!(scheduler.assign("7.0.0.2".parse().unwrap()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disconnect_releases_assignment() {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .set(Keyspace::Relays, "relay-a", "203.0.113.1:5114", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        let scheduler = Arc::new(
            FleetScheduler::new(registry.clone()).with_interval(Duration::from_secs(60)),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&scheduler).run(listener, cancel.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut line = String::new();
        tokio::io::BufReader::new(reader).read_line(&mut line).await.unwrap();
        writer.write_all(line.as_bytes()).await.unwrap();
        assert_eq!(
            registry.get(Keyspace::Clients, "127.0.0.1").await.unwrap().as_deref(),
            Some("203.0.113.1:5114")
        );

        drop(writer);
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.get(Keyspace::Clients, "127.0.0.1").await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("assignment not released");
        assert!(scheduler.sessions().is_empty());

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_session_state_serialization() {
        let json = serde_json::to_string(&SessionState::Assigned("relay2:5114".into())).unwrap();
        assert_eq!(json, r#"{"state":"assigned","relay":"relay2:5114"}"#);
        let json = serde_json::to_string(&SessionState::Connected).unwrap();
        assert_eq!(json, r#"{"state":"connected"}"#);
    }
}
