//! The client's driver task.
//!
//! One task per client consumes the connection's events and owns the two
//! client-side timers: the pending-request sweep and the clock-sync poll.
//! Both only run while the connection is open.
//!
//! Incoming messages are received in wire order on this task. Only the
//! routed handler and its reply are spawned, so a slow handler never holds
//! up the messages behind it.

use std::future::Future;
use std::sync::Weak;
use std::time::Duration;

use tandem_connection::ConnectionEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::{Client, ClientInner};

pub(crate) struct Driver {
    client: Weak<ClientInner>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    check_interval: Duration,
    clock_sync_interval: Option<Duration>,
    next_sweep: Option<Instant>,
    next_clock_sync: Option<Instant>,
}

impl Driver {
    pub(crate) fn new(
        client: Weak<ClientInner>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        check_interval: Duration,
        clock_sync_interval: Option<Duration>,
    ) -> Self {
        Self {
            client,
            events,
            check_interval,
            clock_sync_interval,
            next_sweep: None,
            next_clock_sync: None,
        }
    }

    /// Runs until the connection's event stream ends or the client is
    /// dropped.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                event = self.events.recv() => match event {
                    Some(event) => {
                        if !self.handle_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },

                () = sleep_until(self.next_sweep) => {
                    let Some(client) = self.upgrade() else { break };
                    client.sweep().await;
                    self.next_sweep = Some(Instant::now() + self.check_interval);
                }

                () = sleep_until(self.next_clock_sync) => {
                    let Some(client) = self.upgrade() else { break };
                    tokio::spawn(async move {
                        if let Err(e) = client.sync_clock().await {
                            tracing::warn!(error = %e, "clock sync failed");
                        }
                    });
                    self.next_clock_sync = self
                        .clock_sync_interval
                        .map(|interval| Instant::now() + interval);
                }
            }
        }
        tracing::debug!("client driver stopped");
    }

    /// Returns `false` once the client is gone.
    async fn handle_event(&mut self, event: ConnectionEvent) -> bool {
        let Some(client) = self.upgrade() else {
            return false;
        };
        match event {
            ConnectionEvent::Opened => {
                let now = Instant::now();
                self.next_sweep = Some(now + self.check_interval);
                self.next_clock_sync = self.clock_sync_interval.map(|_| now);
            }
            ConnectionEvent::StateChanged { to, .. } if !to.is_open() => {
                self.next_sweep = None;
                self.next_clock_sync = None;
            }
            ConnectionEvent::Message(raw) => {
                if let Some(incoming) = client.receive(raw).await {
                    tokio::spawn(async move { client.dispatch(incoming).await });
                }
            }
            ConnectionEvent::NotSent(_) => {
                tracing::debug!("message queued until the connection opens");
            }
            ConnectionEvent::Error(message) => {
                tracing::debug!(error = %message, "connection reported an error");
            }
            _ => {}
        }
        true
    }

    fn upgrade(&self) -> Option<Client> {
        self.client.upgrade().map(Client::from_inner)
    }
}

fn sleep_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
