//! Connection lifecycle: dial, detect loss, redial with a fixed delay until
//! the retry budget runs out.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{RelayError, Result};
use crate::net_link::{Connection, Connector};

// 连续失败 30 次后放弃，每次间隔固定 2 秒（不做指数退避）
pub const MAX_RECONNECT_ATTEMPTS: u32 = 30;
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

// 连续失败计数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    attempts_made: u32,
    max_attempts: u32,
    delay: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY)
    }
}

impl RetryBudget {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            attempts_made: 0,
            max_attempts,
            delay,
        }
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// Counts one failure; returns true once the budget is spent.
    pub fn record_failure(&mut self) -> bool {
        self.attempts_made = self.attempts_made.saturating_add(1);
        self.is_exhausted()
    }

    pub fn reset(&mut self) {
        self.attempts_made = 0;
    }
}

/// How a connected session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Shutdown was requested; do not reconnect.
    Shutdown,
    /// The connection failed or the peer went away.
    Lost(RelayError),
}

/// Runs traffic over a connection until it ends.
#[async_trait]
pub trait SessionDriver: Send {
    /// Called after a successful dial, before `Connected` is published.
    fn before_connected(&mut self) {}

    async fn drive(
        &mut self,
        conn: &mut dyn Connection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd;
}

/// Resolves once shutdown is requested or the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub struct ReconnectSupervisor {
    connector: Arc<dyn Connector>,
    budget: RetryBudget,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

impl ReconnectSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        budget: RetryBudget,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            budget,
            state,
            shutdown,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn budget(&self) -> RetryBudget {
        self.budget
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            log::info!("Connection state: {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }

    /// Keeps a session alive until shutdown or until the budget is spent.
    ///
    /// Returns `Ok(())` on shutdown and `RetryBudgetExhausted` once
    /// `max_attempts` consecutive dials or sessions have failed. No attempt
    /// is made after that.
    pub async fn run<D: SessionDriver>(mut self, driver: &mut D) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            let dialed = tokio::select! {
                dialed = self.connector.dial() => dialed,
                _ = shutdown_requested(&mut self.shutdown) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
            };

            let failure = match dialed {
                Ok(mut conn) => {
                    // 连接成功，重置重试计数
                    self.budget.reset();
                    driver.before_connected();
                    self.set_state(ConnectionState::Connected);

                    match driver.drive(conn.as_mut(), &mut self.shutdown).await {
                        SessionEnd::Shutdown => {
                            self.set_state(ConnectionState::Closing);
                            if let Err(e) = conn.close().await {
                                log::warn!("Error while closing connection: {}", e);
                            }
                            self.set_state(ConnectionState::Disconnected);
                            return Ok(());
                        }
                        SessionEnd::Lost(e) => {
                            if let Err(close_err) = conn.close().await {
                                log::warn!("Error while closing lost connection: {}", close_err);
                            }
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            // 意外断开也算一次失败
            if self.budget.record_failure() {
                let attempts = self.budget.attempts_made();
                log::error!(
                    "Giving up after {} consecutive connection failures: {}",
                    attempts,
                    failure
                );
                self.set_state(ConnectionState::Disconnected);
                return Err(RelayError::RetryBudgetExhausted { attempts });
            }

            log::warn!(
                "Connection error: {}. Retrying in {:?} (attempt {}/{})",
                failure,
                self.budget.delay(),
                self.budget.attempts_made(),
                self.budget.max_attempts(),
            );
            self.set_state(ConnectionState::Connecting);
            tokio::select! {
                _ = tokio::time::sleep(self.budget.delay()) => {}
                _ = shutdown_requested(&mut self.shutdown) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
            }
        }
    }
}
