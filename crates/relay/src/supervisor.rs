//! Unbounded reconnect loop around consumer sessions.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use rowbus_core::RelayError;

use crate::dispatcher::{DispatchStats, Dispatcher, SessionState, SessionStatus};
use crate::session::SessionConnector;

/// Runs the dispatcher forever. Whenever a session ends (or fails to start),
/// every resource of that session is released, the supervisor waits a fixed
/// `backoff` and connects again. There is no retry limit and no jitter.
pub struct ReconnectSupervisor {
    connector: SessionConnector,
    dispatcher: Dispatcher,
    backoff: Duration,
}

impl ReconnectSupervisor {
    pub fn new(connector: SessionConnector, dispatcher: Dispatcher, backoff: Duration) -> Self {
        Self {
            connector,
            dispatcher,
            backoff,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.dispatcher.subscribe()
    }

    /// Run until the process is killed.
    pub async fn run(self) -> DispatchStats {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` resolves. Dropping an in-flight session releases
    /// its connections, which returns any unacked delivery to the queue.
    pub async fn run_until<F>(mut self, shutdown: F) -> DispatchStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let ended = tokio::select! {
                _ = &mut shutdown => break,
                ended = self.session() => ended,
            };

            warn!(
                queue = %self.connector.queue(),
                error = %ended,
                backoff = ?self.backoff,
                "consumer session ended; reconnecting after backoff"
            );

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        self.dispatcher.set_state(SessionState::Terminated);
        let stats = self.dispatcher.stats();
        info!(
            queue = %self.connector.queue(),
            acked = stats.acked,
            failed = stats.failed,
            dead_lettered = stats.dead_lettered,
            "consumer stopped"
        );
        stats
    }

    /// One `Connecting → … → Terminated` cycle. Returns what ended it.
    async fn session(&mut self) -> RelayError {
        self.dispatcher.begin_session();
        let status = self.dispatcher.status();
        info!(queue = %self.connector.queue(), session = status.session, "connecting");

        let mut session = match self.connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                self.dispatcher.set_state(SessionState::Terminated);
                return e;
            }
        };

        let ended = self.dispatcher.run_session(&mut session).await;
        session.close().await;
        self.dispatcher.set_state(SessionState::Terminated);
        ended
    }
}
