//! Connection lifecycle: an explicit state machine and the driver that runs it
//! against a [`Connector`].
//!
//! ```text
//! Disconnected --ConnectRequested--> Connecting --DiscoverySucceeded--> Connected
//! Connecting --DiscoveryFailed--> Disconnected
//! Connected --TransportDisconnected--> Reconnecting --DiscoverySucceeded--> Connected
//! Reconnecting --DiscoveryFailed--> Reconnecting | Disconnected (retries exhausted)
//! any --Closed--> Disconnected
//! ```

use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, timeout, Duration};

use crate::config::ReconnectPolicy;
use crate::error::{BmsError, Result};
use crate::transport::{Connector, Link};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// The inputs of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectRequested,
    DiscoverySucceeded,
    DiscoveryFailed,
    TransportDisconnected,
    Closed,
}

/// What the driver has to do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Idle,
    Retry { attempt: u32, after: Duration },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: SessionState,
    /// Consecutive failed reconnect attempts
    retries: u32,
    policy: ReconnectPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: SessionState::Disconnected,
            retries: 0,
            policy,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn handle(&mut self, event: LinkEvent) -> Result<Next> {
        use LinkEvent::*;
        use SessionState::*;

        let next = match (self.state, event) {
            (_, Closed) => {
                self.state = Disconnected;
                Next::Idle
            }
            (Disconnected, ConnectRequested) => {
                self.state = Connecting;
                self.retries = 0;
                Next::Idle
            }
            (Connecting | Reconnecting, DiscoverySucceeded) => {
                self.state = Connected;
                self.retries = 0;
                Next::Idle
            }
            (Connecting, DiscoveryFailed) => {
                self.state = Disconnected;
                Next::Idle
            }
            (Connected, TransportDisconnected) => {
                self.state = Reconnecting;
                self.schedule_retry()
            }
            (Reconnecting, DiscoveryFailed) => {
                self.retries += 1;
                self.schedule_retry()
            }
            (state, event) => return Err(BmsError::InvalidTransition { state, event }),
        };
        Ok(next)
    }

    fn schedule_retry(&mut self) -> Next {
        if self.retries >= self.policy.max_retries {
            self.state = SessionState::Disconnected;
            return Next::Exhausted { attempts: self.retries };
        }
        Next::Retry {
            attempt: self.retries + 1,
            after: self.policy.delay,
        }
    }
}

/// Owns the connector and the connection state. The state is also published on a
/// watch channel for anything that needs to know whether the link is up.
pub struct ConnectionManager<C> {
    connector: C,
    machine: ConnectionMachine,
    state: watch::Sender<SessionState>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            connector,
            machine: ConnectionMachine::new(policy),
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// First connect. A failure leaves the manager disconnected and is not retried.
    pub async fn connect(&mut self) -> Result<Link<C::Writer>> {
        self.apply(LinkEvent::ConnectRequested)?;
        match self.attempt().await {
            Ok(link) => {
                self.apply(LinkEvent::DiscoverySucceeded)?;
                tracing::info!("connected");
                Ok(link)
            }
            Err(err) => {
                self.apply(LinkEvent::DiscoveryFailed)?;
                tracing::warn!(%err, "connect failed");
                Err(err)
            }
        }
    }

    /// Try to get the link back after the transport dropped it.
    ///
    /// Every failed attempt is handed to `on_failure`. Returns `Ok(None)` if
    /// `shutdown` fired while waiting or while an attempt was in flight. Gives up
    /// with [`BmsError::RetriesExhausted`] once the retry budget is spent.
    pub async fn reconnect<F>(
        &mut self,
        shutdown: &mut oneshot::Receiver<()>,
        mut on_failure: F,
    ) -> Result<Option<Link<C::Writer>>>
    where
        F: FnMut(&BmsError),
    {
        let mut next = self.apply(LinkEvent::TransportDisconnected)?;
        loop {
            match next {
                Next::Retry { attempt, after } => {
                    tokio::select! {
                        _ = sleep(after) => {}
                        _ = &mut *shutdown => {
                            self.apply(LinkEvent::Closed)?;
                            return Ok(None);
                        }
                    }
                    tracing::info!(attempt, "reconnecting");
                    let outcome = tokio::select! {
                        outcome = self.attempt() => outcome,
                        _ = &mut *shutdown => {
                            tracing::info!(attempt, "reconnect abandoned");
                            self.apply(LinkEvent::Closed)?;
                            return Ok(None);
                        }
                    };
                    match outcome {
                        Ok(link) => {
                            self.apply(LinkEvent::DiscoverySucceeded)?;
                            tracing::info!(attempt, "reconnected");
                            return Ok(Some(link));
                        }
                        Err(err) => {
                            tracing::warn!(attempt, %err, "reconnect failed");
                            on_failure(&err);
                            next = self.apply(LinkEvent::DiscoveryFailed)?;
                        }
                    }
                }
                Next::Exhausted { attempts } => {
                    tracing::error!(attempts, "giving up reconnecting");
                    return Err(BmsError::RetriesExhausted { attempts });
                }
                Next::Idle => return Ok(None),
            }
        }
    }

    /// One connector call, bounded by the policy's connect timeout.
    async fn attempt(&mut self) -> Result<Link<C::Writer>> {
        let limit = self.machine.policy().connect_timeout;
        match timeout(limit, self.connector.connect()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BmsError::ConnectFailure(format!(
                "no link after {}ms",
                limit.as_millis()
            ))),
        }
    }

    /// Disconnect on request. Not an error if the transport is already gone.
    pub async fn close(&mut self) -> Result<()> {
        let was = self.state();
        self.apply(LinkEvent::Closed)?;
        if was != SessionState::Disconnected {
            if let Err(err) = self.connector.disconnect().await {
                tracing::warn!(%err, "disconnect failed");
            }
        }
        Ok(())
    }

    fn apply(&mut self, event: LinkEvent) -> Result<Next> {
        let next = self.machine.handle(event)?;
        self.state.send_replace(self.machine.state());
        Ok(next)
    }
}

#[cfg(test)]
fn machine(max_retries: u32) -> ConnectionMachine {
    ConnectionMachine::new(ReconnectPolicy {
        delay: Duration::from_millis(1000),
        max_retries,
        ..ReconnectPolicy::default()
    })
}

#[test]
fn test_connects() {
    let mut m = machine(5);
    assert_eq!(m.handle(LinkEvent::ConnectRequested), Ok(Next::Idle));
    assert_eq!(m.state(), SessionState::Connecting);
    assert_eq!(m.handle(LinkEvent::DiscoverySucceeded), Ok(Next::Idle));
    assert_eq!(m.state(), SessionState::Connected);
}

#[test]
fn test_initial_failure_is_not_retried() {
    let mut m = machine(5);
    m.handle(LinkEvent::ConnectRequested).unwrap();
    assert_eq!(m.handle(LinkEvent::DiscoveryFailed), Ok(Next::Idle));
    assert_eq!(m.state(), SessionState::Disconnected);
}

#[test]
fn test_retries_are_bounded() {
    let mut m = machine(5);
    m.handle(LinkEvent::ConnectRequested).unwrap();
    m.handle(LinkEvent::DiscoverySucceeded).unwrap();

    let mut next = m.handle(LinkEvent::TransportDisconnected).unwrap();
    let mut attempts = Vec::new();
    while let Next::Retry { attempt, after } = next {
        assert_eq!(after, Duration::from_millis(1000));
        assert_eq!(m.state(), SessionState::Reconnecting);
        attempts.push(attempt);
        next = m.handle(LinkEvent::DiscoveryFailed).unwrap();
    }

    assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
    assert_eq!(next, Next::Exhausted { attempts: 5 });
    assert_eq!(m.state(), SessionState::Disconnected);
}

#[test]
fn test_successful_reconnect_resets_the_counter() {
    let mut m = machine(5);
    m.handle(LinkEvent::ConnectRequested).unwrap();
    m.handle(LinkEvent::DiscoverySucceeded).unwrap();
    m.handle(LinkEvent::TransportDisconnected).unwrap();
    m.handle(LinkEvent::DiscoveryFailed).unwrap();
    m.handle(LinkEvent::DiscoveryFailed).unwrap();
    assert_eq!(m.retries(), 2);

    m.handle(LinkEvent::DiscoverySucceeded).unwrap();
    assert_eq!(m.retries(), 0);
    assert_eq!(m.state(), SessionState::Connected);
    assert_eq!(
        m.handle(LinkEvent::TransportDisconnected),
        Ok(Next::Retry { attempt: 1, after: Duration::from_millis(1000) })
    );
}

#[test]
fn test_zero_budget_gives_up_immediately() {
    let mut m = machine(0);
    m.handle(LinkEvent::ConnectRequested).unwrap();
    m.handle(LinkEvent::DiscoverySucceeded).unwrap();
    assert_eq!(
        m.handle(LinkEvent::TransportDisconnected),
        Ok(Next::Exhausted { attempts: 0 })
    );
    assert_eq!(m.state(), SessionState::Disconnected);
}

#[test]
fn test_rejects_invalid_transitions() {
    let mut m = machine(5);
    assert_eq!(
        m.handle(LinkEvent::TransportDisconnected),
        Err(BmsError::InvalidTransition {
            state: SessionState::Disconnected,
            event: LinkEvent::TransportDisconnected,
        })
    );
    m.handle(LinkEvent::ConnectRequested).unwrap();
    assert!(m.handle(LinkEvent::ConnectRequested).is_err());
}

#[test]
fn test_close_always_disconnects() {
    let mut m = machine(5);
    m.handle(LinkEvent::ConnectRequested).unwrap();
    m.handle(LinkEvent::DiscoverySucceeded).unwrap();
    assert_eq!(m.handle(LinkEvent::Closed), Ok(Next::Idle));
    assert_eq!(m.state(), SessionState::Disconnected);
    assert_eq!(m.handle(LinkEvent::Closed), Ok(Next::Idle));
}
