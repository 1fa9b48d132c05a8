//! Client session context
//!
//! The `Client` is the explicit, session-scoped root object: it owns the
//! conductor, the pending-command table inside it, and the background agent
//! task (unless configured for direct invocation). There is no ambient
//! global state; connect and close are explicit.

use std::sync::Arc;

use crate::client::command::DriverHandle;
use crate::client::conductor::ClientConductor;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::publication::{ExclusivePublication, Publication};
use crate::subscription::Subscription;

/// One client session against one driver
pub struct Client {
    conductor: Arc<ClientConductor>,
    agent: Option<tokio::task::JoinHandle<()>>,
}

impl Client {
    /// Connect a session over a driver conduit.
    ///
    /// Unless `use_conductor_invoker` is set, a background agent task steps
    /// the conductor duty cycle; this requires a tokio runtime. With the
    /// invoker enabled the embedding thread steps it via
    /// [`invoke`](Self::invoke) instead.
    pub fn connect(config: ClientConfig, handle: DriverHandle) -> Self {
        let use_invoker = config.use_conductor_invoker;
        let idle_interval = config.idle_interval;
        let conductor = ClientConductor::new(config, handle);
        tracing::info!(
            client_id = conductor.client_id(),
            invoker = use_invoker,
            "Client connected"
        );

        let agent = if use_invoker {
            None
        } else {
            let conductor = Arc::clone(&conductor);
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(idle_interval);
                loop {
                    ticker.tick().await;
                    if conductor.is_closed() {
                        break;
                    }
                    conductor.do_work();
                }
            }))
        };

        Self { conductor, agent }
    }

    /// Driver-assigned client identity
    pub fn client_id(&self) -> i64 {
        self.conductor.client_id()
    }

    /// Step the conductor duty cycle once (invoker mode); returns an
    /// indication of work done
    pub fn invoke(&self) -> usize {
        self.conductor.do_work()
    }

    /// Issue an add-publication command; poll the returned registration id
    /// with [`find_publication`](Self::find_publication)
    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Result<i64> {
        self.conductor.add_publication(channel, stream_id, false)
    }

    /// Issue an add-exclusive-publication command; poll with
    /// [`find_exclusive_publication`](Self::find_exclusive_publication)
    pub fn add_exclusive_publication(&self, channel: &str, stream_id: i32) -> Result<i64> {
        self.conductor.add_publication(channel, stream_id, true)
    }

    /// Issue an add-subscription command; poll with
    /// [`find_subscription`](Self::find_subscription)
    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Result<i64> {
        self.conductor.add_subscription(channel, stream_id)
    }

    /// Poll for a publication; `Ok(None)` while the command is in flight
    pub fn find_publication(&self, registration_id: i64) -> Result<Option<Arc<Publication>>> {
        self.conductor.find_publication(registration_id)
    }

    /// Poll for an exclusive publication
    pub fn find_exclusive_publication(
        &self,
        registration_id: i64,
    ) -> Result<Option<Arc<ExclusivePublication>>> {
        self.conductor.find_exclusive_publication(registration_id)
    }

    /// Poll for a subscription
    pub fn find_subscription(&self, registration_id: i64) -> Result<Option<Arc<Subscription>>> {
        self.conductor.find_subscription(registration_id)
    }

    /// Whether the session is closed (explicitly or by driver loss)
    pub fn is_closed(&self) -> bool {
        self.conductor.is_closed()
    }

    /// Tear the session down: close every handle and detach from the driver
    pub fn close(&mut self) {
        self.conductor.close();
        if let Some(agent) = self.agent.take() {
            agent.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.client_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
