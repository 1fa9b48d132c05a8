//! Client conductor: asynchronous command issuance and completion matching
//!
//! Client threads enqueue lifecycle commands tagged with fresh correlation
//! ids and return immediately; the conductor's duty cycle drains the driver's
//! response queue, matches correlation ids against the pending table, and
//! moves entries to their resolved outcome. Callers observe outcomes only
//! through the non-blocking `find_*` accessors. Losing the driver heartbeat
//! fails every outstanding entry and poisons the whole session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::client::command::{epoch_ms, Command, DriverHandle, Response};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::publication::{ExclusivePublication, Publication};
use crate::subscription::{Image, Subscription};

/// What an issued command is waiting to become
#[derive(Debug, Clone, Copy)]
enum PendingKind {
    Publication { exclusive: bool },
    Subscription,
    Destination,
}

#[derive(Debug)]
struct Pending {
    kind: PendingKind,
    deadline_ms: i64,
}

/// Mutable conductor state; writes happen on the duty cycle and on command
/// issue, reads through the polling accessors
struct ConductorState {
    from_driver: UnboundedReceiver<Response>,
    pending: HashMap<i64, Pending>,
    publications: HashMap<i64, Arc<Publication>>,
    exclusive_publications: HashMap<i64, Arc<ExclusivePublication>>,
    subscriptions: HashMap<i64, Arc<Subscription>>,
    /// Failed publication/subscription commands, kept so repeated finds keep
    /// returning the same outcome
    command_errors: HashMap<i64, ClientError>,
    /// Resolved destination operations, same retention rule
    destination_responses: HashMap<i64, std::result::Result<(), ClientError>>,
    last_keepalive_ms: i64,
}

/// Mediator for all asynchronous lifecycle commands of one client session
pub struct ClientConductor {
    to_driver: UnboundedSender<Command>,
    state: Mutex<ConductorState>,
    correlation_counter: AtomicI64,
    heartbeat: Arc<AtomicI64>,
    closed: AtomicBool,
    client_id: i64,
    config: ClientConfig,
}

impl ClientConductor {
    /// Build a conductor over the driver conduit
    pub fn new(config: ClientConfig, handle: DriverHandle) -> Arc<Self> {
        Arc::new(Self {
            to_driver: handle.to_driver,
            state: Mutex::new(ConductorState {
                from_driver: handle.from_driver,
                pending: HashMap::new(),
                publications: HashMap::new(),
                exclusive_publications: HashMap::new(),
                subscriptions: HashMap::new(),
                command_errors: HashMap::new(),
                destination_responses: HashMap::new(),
                last_keepalive_ms: epoch_ms(),
            }),
            correlation_counter: AtomicI64::new(0),
            heartbeat: handle.heartbeat,
            closed: AtomicBool::new(false),
            client_id: handle.client_id,
            config,
        })
    }

    /// Driver-assigned client identity
    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    /// Whether the session has been closed (explicitly or by driver loss)
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ClientError::DriverNotActive)
        } else {
            Ok(())
        }
    }

    fn next_correlation_id(&self) -> i64 {
        self.correlation_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn send(&self, command: Command) -> Result<()> {
        self.to_driver
            .send(command)
            .map_err(|_| ClientError::DriverNotActive)
    }

    /// Issue an add-publication command; resolve via [`find_publication`]
    ///
    /// [`find_publication`]: Self::find_publication
    pub fn add_publication(&self, channel: &str, stream_id: i32, exclusive: bool) -> Result<i64> {
        self.ensure_open()?;
        let correlation_id = self.next_correlation_id();
        {
            let mut state = self.state.lock().unwrap();
            state.pending.insert(
                correlation_id,
                Pending {
                    kind: PendingKind::Publication { exclusive },
                    deadline_ms: epoch_ms() + self.config.command_timeout.as_millis() as i64,
                },
            );
        }
        self.send(Command::AddPublication {
            correlation_id,
            client_id: self.client_id,
            channel: channel.to_string(),
            stream_id,
            exclusive,
        })?;
        Ok(correlation_id)
    }

    /// Issue an add-subscription command; resolve via [`find_subscription`]
    ///
    /// [`find_subscription`]: Self::find_subscription
    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Result<i64> {
        self.ensure_open()?;
        let correlation_id = self.next_correlation_id();
        {
            let mut state = self.state.lock().unwrap();
            state.pending.insert(
                correlation_id,
                Pending {
                    kind: PendingKind::Subscription,
                    deadline_ms: epoch_ms() + self.config.command_timeout.as_millis() as i64,
                },
            );
        }
        self.send(Command::AddSubscription {
            correlation_id,
            client_id: self.client_id,
            channel: channel.to_string(),
            stream_id,
        })?;
        Ok(correlation_id)
    }

    /// Issue an add-destination command on behalf of a publication
    pub fn add_destination(&self, publication_id: i64, channel: &str) -> Result<i64> {
        self.ensure_open()?;
        let correlation_id = self.next_correlation_id();
        {
            let mut state = self.state.lock().unwrap();
            state.pending.insert(
                correlation_id,
                Pending {
                    kind: PendingKind::Destination,
                    deadline_ms: epoch_ms() + self.config.command_timeout.as_millis() as i64,
                },
            );
        }
        self.send(Command::AddDestination {
            correlation_id,
            client_id: self.client_id,
            publication_id,
            channel: channel.to_string(),
        })?;
        Ok(correlation_id)
    }

    /// Issue a remove-destination command referencing the add's correlation id
    pub fn remove_destination(&self, publication_id: i64, destination_id: i64) -> Result<i64> {
        self.ensure_open()?;
        let correlation_id = self.next_correlation_id();
        {
            let mut state = self.state.lock().unwrap();
            state.pending.insert(
                correlation_id,
                Pending {
                    kind: PendingKind::Destination,
                    deadline_ms: epoch_ms() + self.config.command_timeout.as_millis() as i64,
                },
            );
        }
        self.send(Command::RemoveDestination {
            correlation_id,
            client_id: self.client_id,
            publication_id,
            destination_id,
        })?;
        Ok(correlation_id)
    }

    /// Poll for a publication created by [`add_publication`]
    ///
    /// Returns `Ok(None)` while the command is in flight.
    ///
    /// [`add_publication`]: Self::add_publication
    pub fn find_publication(&self, registration_id: i64) -> Result<Option<Arc<Publication>>> {
        self.ensure_open()?;
        let state = self.state.lock().unwrap();
        if let Some(publication) = state.publications.get(&registration_id) {
            return Ok(Some(Arc::clone(publication)));
        }
        if let Some(err) = state.command_errors.get(&registration_id) {
            return Err(err.clone());
        }
        if state.pending.contains_key(&registration_id) {
            return Ok(None);
        }
        Err(ClientError::UnknownCorrelation(registration_id))
    }

    /// Poll for an exclusive publication
    pub fn find_exclusive_publication(
        &self,
        registration_id: i64,
    ) -> Result<Option<Arc<ExclusivePublication>>> {
        self.ensure_open()?;
        let state = self.state.lock().unwrap();
        if let Some(publication) = state.exclusive_publications.get(&registration_id) {
            return Ok(Some(Arc::clone(publication)));
        }
        if let Some(err) = state.command_errors.get(&registration_id) {
            return Err(err.clone());
        }
        if state.pending.contains_key(&registration_id) {
            return Ok(None);
        }
        Err(ClientError::UnknownCorrelation(registration_id))
    }

    /// Poll for a subscription
    pub fn find_subscription(&self, registration_id: i64) -> Result<Option<Arc<Subscription>>> {
        self.ensure_open()?;
        let state = self.state.lock().unwrap();
        if let Some(subscription) = state.subscriptions.get(&registration_id) {
            return Ok(Some(Arc::clone(subscription)));
        }
        if let Some(err) = state.command_errors.get(&registration_id) {
            return Err(err.clone());
        }
        if state.pending.contains_key(&registration_id) {
            return Ok(None);
        }
        Err(ClientError::UnknownCorrelation(registration_id))
    }

    /// Poll the outcome of a destination add/remove.
    ///
    /// Idempotent: a resolved outcome keeps being returned on every call.
    pub fn find_destination_response(&self, correlation_id: i64) -> Result<Option<()>> {
        self.ensure_open()?;
        let state = self.state.lock().unwrap();
        if let Some(outcome) = state.destination_responses.get(&correlation_id) {
            return match outcome {
                Ok(()) => Ok(Some(())),
                Err(err) => Err(err.clone()),
            };
        }
        if state.pending.contains_key(&correlation_id) {
            return Ok(None);
        }
        Err(ClientError::UnknownCorrelation(correlation_id))
    }

    /// Release a publication's driver resources and drop it from the session
    pub fn close_publication(&self, registration_id: i64) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let concurrent = state.publications.remove(&registration_id);
            let exclusive = state.exclusive_publications.remove(&registration_id);
            if let Some(ref publication) = concurrent {
                publication.mark_closed();
            }
            if let Some(ref publication) = exclusive {
                publication.mark_closed();
            }
            concurrent.is_some() || exclusive.is_some()
        };
        if removed && !self.is_closed() {
            let correlation_id = self.next_correlation_id();
            let _ = self.send(Command::ClosePublication {
                correlation_id,
                client_id: self.client_id,
                registration_id,
            });
        }
    }

    /// Release a subscription's driver resources and drop it from the session
    pub fn close_subscription(&self, registration_id: i64) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            if let Some(subscription) = state.subscriptions.remove(&registration_id) {
                subscription.mark_closed();
                true
            } else {
                false
            }
        };
        if removed && !self.is_closed() {
            let correlation_id = self.next_correlation_id();
            let _ = self.send(Command::CloseSubscription {
                correlation_id,
                client_id: self.client_id,
                registration_id,
            });
        }
    }

    /// One duty cycle: keepalive, drain responses, expire stale commands.
    ///
    /// Never invoked concurrently with itself; either the background agent
    /// task or the embedding thread steps it.
    pub fn do_work(self: &Arc<Self>) -> usize {
        if self.is_closed() {
            return 0;
        }

        let now_ms = epoch_ms();
        let heartbeat_ms = self.heartbeat.load(Ordering::Acquire);
        if now_ms - heartbeat_ms > self.config.driver_timeout.as_millis() as i64 {
            self.on_driver_timeout(now_ms - heartbeat_ms);
            return 0;
        }

        let mut work_count = 0;
        let mut state = self.state.lock().unwrap();

        if now_ms - state.last_keepalive_ms >= self.config.keepalive_interval.as_millis() as i64 {
            state.last_keepalive_ms = now_ms;
            let _ = self.to_driver.send(Command::ClientKeepalive {
                client_id: self.client_id,
            });
            work_count += 1;
        }

        while let Ok(response) = state.from_driver.try_recv() {
            self.on_response(&mut state, response);
            work_count += 1;
        }

        let expired: Vec<i64> = state
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline_ms < now_ms)
            .map(|(id, _)| *id)
            .collect();
        for correlation_id in expired {
            let pending = state.pending.remove(&correlation_id).unwrap();
            tracing::warn!(
                correlation_id = correlation_id,
                "Command timed out awaiting driver response"
            );
            match pending.kind {
                PendingKind::Destination => {
                    state
                        .destination_responses
                        .insert(correlation_id, Err(ClientError::CommandTimeout(correlation_id)));
                }
                _ => {
                    state
                        .command_errors
                        .insert(correlation_id, ClientError::CommandTimeout(correlation_id));
                }
            }
            work_count += 1;
        }

        work_count
    }

    fn on_response(self: &Arc<Self>, state: &mut ConductorState, response: Response) {
        match response {
            Response::PublicationReady {
                correlation_id,
                registration_id,
                session_id,
                stream_id,
                control_mode,
                log,
            } => {
                let Some(pending) = state.pending.remove(&correlation_id) else {
                    tracing::debug!(correlation_id, "Publication ready for expired command");
                    return;
                };
                tracing::info!(
                    registration_id = registration_id,
                    session_id = session_id,
                    stream_id = stream_id,
                    control_mode = %control_mode,
                    "Publication ready"
                );
                match pending.kind {
                    PendingKind::Publication { exclusive: false } => {
                        let publication = Arc::new(Publication::new(
                            Arc::clone(self),
                            registration_id,
                            stream_id,
                            session_id,
                            control_mode,
                            log,
                        ));
                        state.publications.insert(registration_id, publication);
                    }
                    PendingKind::Publication { exclusive: true } => {
                        let publication = Arc::new(ExclusivePublication::new(
                            Arc::clone(self),
                            registration_id,
                            stream_id,
                            session_id,
                            control_mode,
                            log,
                        ));
                        state
                            .exclusive_publications
                            .insert(registration_id, publication);
                    }
                    _ => {
                        tracing::warn!(correlation_id, "Publication ready for non-publication command");
                    }
                }
            }
            Response::SubscriptionReady {
                correlation_id,
                registration_id,
            } => {
                if state.pending.remove(&correlation_id).is_none() {
                    tracing::debug!(correlation_id, "Subscription ready for expired command");
                    return;
                }
                tracing::info!(registration_id = registration_id, "Subscription ready");
                let subscription = Arc::new(Subscription::new(Arc::clone(self), registration_id));
                state.subscriptions.insert(registration_id, subscription);
            }
            Response::OperationSuccess { correlation_id } => {
                match state.pending.remove(&correlation_id) {
                    Some(Pending {
                        kind: PendingKind::Destination,
                        ..
                    }) => {
                        state.destination_responses.insert(correlation_id, Ok(()));
                    }
                    Some(_) => {
                        tracing::warn!(correlation_id, "Unexpected operation success");
                    }
                    // close commands are fire-and-forget
                    None => {}
                }
            }
            Response::Error {
                correlation_id,
                code,
                message,
            } => {
                tracing::warn!(
                    correlation_id = correlation_id,
                    code = %code,
                    message = %message,
                    "Driver rejected command"
                );
                let error = ClientError::DriverError { code, message };
                match state.pending.remove(&correlation_id) {
                    Some(Pending {
                        kind: PendingKind::Destination,
                        ..
                    }) => {
                        state
                            .destination_responses
                            .insert(correlation_id, Err(error));
                    }
                    Some(_) => {
                        state.command_errors.insert(correlation_id, error);
                    }
                    None => {}
                }
            }
            Response::AvailableImage {
                correlation_id,
                subscription_registration_id,
                session_id,
                source_identity,
                log,
                subscriber_position,
                join_position,
            } => {
                if let Some(subscription) = state.subscriptions.get(&subscription_registration_id) {
                    tracing::info!(
                        subscription_id = subscription_registration_id,
                        session_id = session_id,
                        source = %source_identity,
                        join_position = join_position,
                        "Image available"
                    );
                    subscription.add_image(Arc::new(Image::new(
                        correlation_id,
                        session_id,
                        source_identity,
                        log,
                        subscriber_position,
                        join_position,
                    )));
                }
            }
            Response::UnavailableImage {
                correlation_id,
                subscription_registration_id,
            } => {
                if let Some(subscription) = state.subscriptions.get(&subscription_registration_id) {
                    tracing::info!(
                        subscription_id = subscription_registration_id,
                        image_id = correlation_id,
                        "Image unavailable"
                    );
                    subscription.remove_image(correlation_id);
                }
            }
        }
    }

    fn on_driver_timeout(&self, silence_ms: i64) {
        tracing::error!(
            silence_ms = silence_ms,
            "Driver heartbeat lost, failing client session"
        );
        self.closed.store(true, Ordering::Release);
        let mut state = self.state.lock().unwrap();

        let outstanding: Vec<(i64, PendingKind)> = state
            .pending
            .drain()
            .map(|(id, pending)| (id, pending.kind))
            .collect();
        for (correlation_id, kind) in outstanding {
            match kind {
                PendingKind::Destination => {
                    state
                        .destination_responses
                        .insert(correlation_id, Err(ClientError::DriverNotActive));
                }
                _ => {
                    state
                        .command_errors
                        .insert(correlation_id, ClientError::DriverNotActive);
                }
            }
        }

        for publication in state.publications.values() {
            publication.mark_closed();
        }
        for publication in state.exclusive_publications.values() {
            publication.mark_closed();
        }
        for subscription in state.subscriptions.values() {
            subscription.mark_closed();
        }
    }

    /// Explicit session teardown: release every handle and tell the driver
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(client_id = self.client_id, "Client closing");
        let mut state = self.state.lock().unwrap();
        for publication in state.publications.values() {
            publication.mark_closed();
        }
        for publication in state.exclusive_publications.values() {
            publication.mark_closed();
        }
        for subscription in state.subscriptions.values() {
            subscription.mark_closed();
        }
        state.publications.clear();
        state.exclusive_publications.clear();
        state.subscriptions.clear();
        let _ = self.to_driver.send(Command::ClientClose {
            client_id: self.client_id,
        });
    }
}

impl std::fmt::Debug for ClientConductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConductor")
            .field("client_id", &self.client_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_conductor(
        config: ClientConfig,
    ) -> (
        Arc<ClientConductor>,
        UnboundedReceiver<Command>,
        UnboundedSender<Response>,
        Arc<AtomicI64>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let heartbeat = Arc::new(AtomicI64::new(epoch_ms()));
        let conductor = ClientConductor::new(
            config,
            DriverHandle {
                client_id: 1,
                to_driver: cmd_tx,
                from_driver: resp_rx,
                heartbeat: Arc::clone(&heartbeat),
            },
        );
        (conductor, cmd_rx, resp_tx, heartbeat)
    }

    #[test]
    fn test_correlation_ids_unique_and_monotonic() {
        let (conductor, _cmd_rx, _resp_tx, _hb) = test_conductor(ClientConfig::default());
        let a = conductor.add_publication("bus:mem?endpoint=a", 1, false).unwrap();
        let b = conductor.add_subscription("bus:mem?endpoint=a", 1).unwrap();
        let c = conductor.add_destination(a, "bus:mem?endpoint=b").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_find_pending_then_resolved() {
        let (conductor, mut cmd_rx, resp_tx, _hb) = test_conductor(ClientConfig::default());
        let reg = conductor.add_publication("bus:mem?endpoint=a", 7, false).unwrap();

        // still pending
        assert!(conductor.find_publication(reg).unwrap().is_none());

        let cmd = cmd_rx.try_recv().unwrap();
        assert_eq!(cmd.correlation_id(), Some(reg));

        let log = Arc::new(crate::buffer::LogBuffer::new(64 * 1024, 0, 5, 7, 1408));
        resp_tx
            .send(Response::PublicationReady {
                correlation_id: reg,
                registration_id: reg,
                session_id: 5,
                stream_id: 7,
                control_mode: crate::client::command::ControlMode::Manual,
                log,
            })
            .unwrap();

        conductor.do_work();
        let publication = conductor.find_publication(reg).unwrap().unwrap();
        assert_eq!(publication.stream_id(), 7);
        assert_eq!(publication.session_id(), 5);
    }

    #[test]
    fn test_no_cross_resolution_between_commands() {
        let (conductor, _cmd_rx, resp_tx, _hb) = test_conductor(ClientConfig::default());
        let pub_a = conductor.add_publication("bus:mem?endpoint=a", 1, false).unwrap();
        let pub_b = conductor.add_publication("bus:mem?endpoint=b", 2, false).unwrap();

        let log = Arc::new(crate::buffer::LogBuffer::new(64 * 1024, 0, 9, 2, 1408));
        resp_tx
            .send(Response::PublicationReady {
                correlation_id: pub_b,
                registration_id: pub_b,
                session_id: 9,
                stream_id: 2,
                control_mode: crate::client::command::ControlMode::None,
                log,
            })
            .unwrap();
        conductor.do_work();

        // command A stays pending; command B resolved; no cross-talk
        assert!(conductor.find_publication(pub_a).unwrap().is_none());
        assert!(conductor.find_publication(pub_b).unwrap().is_some());
    }

    #[test]
    fn test_error_response_resolves_to_error() {
        let (conductor, _cmd_rx, resp_tx, _hb) = test_conductor(ClientConfig::default());
        let reg = conductor.add_subscription("bus:junk", 1).unwrap();

        resp_tx
            .send(Response::Error {
                correlation_id: reg,
                code: crate::error::ErrorCode::InvalidChannel,
                message: "unknown media".to_string(),
            })
            .unwrap();
        conductor.do_work();

        let err = conductor.find_subscription(reg).unwrap_err();
        assert!(matches!(err, ClientError::DriverError { .. }));
        // repeated find keeps returning the same outcome
        assert!(conductor.find_subscription(reg).is_err());
    }

    #[test]
    fn test_command_timeout_expires_pending() {
        let config = ClientConfig::default().command_timeout(std::time::Duration::from_millis(100));
        let (conductor, _cmd_rx, _resp_tx, hb) = test_conductor(config);
        let reg = conductor.add_publication("bus:mem?endpoint=a", 1, false).unwrap();

        // keep the driver "alive" while the command response never arrives
        std::thread::sleep(std::time::Duration::from_millis(150));
        hb.store(epoch_ms(), Ordering::Release);
        conductor.do_work();

        let err = conductor.find_publication(reg).unwrap_err();
        assert!(matches!(err, ClientError::CommandTimeout(_)));
    }

    #[test]
    fn test_driver_silence_poisons_session() {
        let config = ClientConfig::default().driver_timeout(std::time::Duration::from_millis(100));
        let (conductor, _cmd_rx, _resp_tx, hb) = test_conductor(config);
        let reg = conductor.add_destination(1, "bus:mem?endpoint=a").unwrap();

        hb.store(epoch_ms() - 5_000, Ordering::Release);
        conductor.do_work();

        assert!(conductor.is_closed());
        // everything fails fast from now on, nothing hangs
        assert!(matches!(
            conductor.find_destination_response(reg),
            Err(ClientError::DriverNotActive)
        ));
        assert!(matches!(
            conductor.add_publication("bus:mem?endpoint=a", 1, false),
            Err(ClientError::DriverNotActive)
        ));
    }

    #[test]
    fn test_unknown_correlation_is_an_error() {
        let (conductor, _cmd_rx, _resp_tx, _hb) = test_conductor(ClientConfig::default());
        assert!(matches!(
            conductor.find_publication(12345),
            Err(ClientError::UnknownCorrelation(12345))
        ));
    }
}
