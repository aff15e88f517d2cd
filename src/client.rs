//! The client ties connection, session and polling together.
//!
//! Everything runs in one loop: notifications, polling ticks, write failures,
//! disconnects and the shutdown signal are handled one at a time, so handlers never
//! run concurrently with each other or with a state change. Command writes happen
//! on the session's writer task and never block the loop.

use futures_util::StreamExt;
use tokio::sync::{oneshot, watch};

use crate::command::{Command, TelemetryKind};
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, SessionState};
use crate::error::{BmsError, Result};
use crate::event_bus::{EventBus, SubscriptionId};
use crate::polling::PollingScheduler;
use crate::session::{query, ProtocolSession};
use crate::telemetry::TelemetryEvent;
use crate::transport::{Connector, Link, NotificationStream};

pub struct BmsClient<C: Connector> {
    manager: ConnectionManager<C>,
    session: ProtocolSession,
    config: ClientConfig,
}

impl<C: Connector> BmsClient<C> {
    pub fn new(connector: C, config: ClientConfig) -> Self {
        Self {
            manager: ConnectionManager::new(connector, config.reconnect),
            session: ProtocolSession::new(EventBus::new(), config.write_timeout),
            config,
        }
    }

    pub fn subscribe<F>(&mut self, kind: TelemetryKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&TelemetryEvent) + Send + 'static,
    {
        self.session.bus_mut().subscribe(kind, handler)
    }

    /// Register for non-fatal errors: rejected frames, failed writes, lost links and
    /// failed reconnect attempts.
    pub fn on_error<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&BmsError) + Send + 'static,
    {
        self.session.bus_mut().on_error(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.session.bus_mut().unsubscribe(id)
    }

    pub fn state(&self) -> SessionState {
        self.manager.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.manager.watch_state()
    }

    /// True while notifications are subscribed and commands can be issued.
    pub fn is_started(&self) -> bool {
        self.session.is_started()
    }

    pub fn connector(&self) -> &C {
        self.manager.connector()
    }

    /// Connect, then poll and publish until `shutdown` fires or the link is lost for good.
    ///
    /// The initial connect is not retried. Once connected, a lost link is retried as
    /// configured; running out of retries ends the loop with
    /// [`BmsError::RetriesExhausted`].
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let link = match self.manager.connect().await {
            Ok(link) => link,
            Err(err) => {
                self.session.bus_mut().report(&err);
                return Err(err);
            }
        };
        let mut notifications = self.attach(link);
        let mut poller = PollingScheduler::new(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutting down");
                    self.session.stop();
                    drop(notifications);
                    return self.manager.close().await;
                }
                item = notifications.next() => {
                    let lost = match item {
                        Some(Ok(buffer)) => {
                            self.session.on_notification(&buffer);
                            None
                        }
                        Some(Err(err)) => Some(err.to_string()),
                        None => Some("end of notification stream".to_string()),
                    };
                    let Some(reason) = lost else {
                        continue;
                    };

                    self.session.stop();
                    let err = BmsError::UnexpectedDisconnect(reason);
                    tracing::warn!(%err, "link lost");
                    self.session.bus_mut().report(&err);

                    let bus = self.session.bus_mut();
                    match self.manager.reconnect(&mut shutdown, |err| bus.report(err)).await {
                        Ok(Some(link)) => {
                            notifications = self.attach(link);
                            poller.reset();
                        }
                        Ok(None) => return Ok(()),
                        Err(err) => {
                            self.session.bus_mut().report(&err);
                            return Err(err);
                        }
                    }
                }
                Some(err) = self.session.write_failure() => {
                    tracing::warn!(%err, "write failed");
                    self.session.bus_mut().report(&err);
                }
                _ = poller.tick() => {
                    poller.poll(&mut self.session);
                }
            }
        }
    }

    /// Connect, read every polled command once, and disconnect.
    pub async fn fetch_once(&mut self) -> Result<Vec<TelemetryEvent>> {
        let mut link = self.manager.connect().await?;

        let mut events = Vec::new();
        let mut outcome = Ok(());
        for command in Command::POLL_CYCLE {
            match query(&mut link, command.code(), self.config.response_timeout).await {
                Ok(batch) => events.extend(batch),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        drop(link);
        self.manager.close().await?;
        outcome.map(|()| events)
    }

    fn attach(&mut self, link: Link<C::Writer>) -> NotificationStream {
        self.session.start(link.writer);
        link.notifications
    }
}
