//! Client-side control agent
//!
//! Holds the control session with the scheduler, applies every switch
//! command to the client bridge and acknowledges it. The bridge keeps
//! running throughout; only the transport destination changes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{encode_switch, parse_switch, read_line};
use crate::bridge::ClientStrategy;
use crate::error::SchedulerError;
use crate::registry::resolve_endpoint;

/// Default wait before reconnecting a lost control session
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Applies scheduler switch commands to a client bridge
#[derive(Debug)]
pub struct ControlAgent {
    scheduler: String,
    strategy: Arc<ClientStrategy>,
    reconnect_delay: Duration,
}

impl ControlAgent {
    /// Create an agent for the scheduler at `scheduler` (`host:port`)
    pub fn new(scheduler: impl Into<String>, strategy: Arc<ClientStrategy>) -> Self {
        Self {
            scheduler: scheduler.into(),
            strategy,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Override the reconnect delay
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Keep a control session open until `cancel` fires, reconnecting after
    /// failures.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let connect = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                res = TcpStream::connect(&self.scheduler) => res,
            };

            match connect {
                Ok(stream) => {
                    info!(scheduler = %self.scheduler, "control session established");
                    match self.serve(stream, &cancel).await {
                        Ok(()) => break,
                        Err(e) => {
                            warn!(scheduler = %self.scheduler, error = %e, "control session lost");
                        }
                    }
                }
                Err(e) => {
                    warn!(scheduler = %self.scheduler, error = %e, "cannot reach scheduler");
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        debug!("control agent stopped");
    }

    /// Serve one control session.
    ///
    /// Returns `Ok(())` when cancelled.
    ///
    /// # Errors
    ///
    /// Returns `Closed` when the scheduler hangs up, `InvalidCommand` for a
    /// command that cannot be applied, or the I/O error.
    pub async fn serve(
        &self,
        stream: TcpStream,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let peer = stream.peer_addr()?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        loop {
            let line = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                line = read_line(&mut reader) => line?,
            };
            let Some(line) = line else {
                return Err(SchedulerError::Closed(peer));
            };

            let endpoint = parse_switch(&line)?;
            let relay = self.apply(endpoint).await?;
            writer.write_all(encode_switch(endpoint).as_bytes()).await?;
            writer.flush().await?;
            debug!(relay = %relay, "switch acknowledged");
        }
    }

    async fn apply(&self, endpoint: &str) -> Result<SocketAddr, SchedulerError> {
        let relay = resolve_endpoint(endpoint)
            .await
            .ok_or_else(|| SchedulerError::InvalidCommand(format!("cannot resolve {endpoint}")))?;
        self.strategy.switch_relay(relay);
        Ok(relay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_switch_and_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let strategy = Arc::new(ClientStrategy::new("127.0.0.1:5114".parse().unwrap(), Vec::new()));
        let agent = ControlAgent::new(addr.to_string(), Arc::clone(&strategy));

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run(cancel).await })
        };

        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(b"127.0.0.2:5114\n").await.unwrap();
        let mut echo = String::new();
        reader.read_line(&mut echo).await.unwrap();
        assert_eq!(echo, "127.0.0.2:5114\n");
        assert_eq!(strategy.current_relay(), "127.0.0.2:5114".parse().unwrap());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_command_ends_session_without_switch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let initial: SocketAddr = "127.0.0.1:5114".parse().unwrap();
        let strategy = Arc::new(ClientStrategy::new(initial, Vec::new()));
        let scheduler = listener.local_addr().unwrap().to_string();
        let agent = ControlAgent::new(scheduler, Arc::clone(&strategy));

        let client = TcpStream::connect(listener.local_addr().unwrap());
        let (client, accepted) = tokio::join!(client, listener.accept());
        let (mut server, _) = accepted.unwrap();
        server.write_all(b"garbage\n").await.unwrap();

        let result = agent.serve(client.unwrap(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(SchedulerError::InvalidCommand(_))));
        assert_eq!(strategy.current_relay(), initial);
    }
}
