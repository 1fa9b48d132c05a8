//! Driver conductor: command execution, frame shipping, liveness
//!
//! The single-threaded counterpart of the client conductor. Each duty cycle
//! it stamps the heartbeat, executes queued lifecycle commands (answering
//! each with exactly one response per correlation id), replicates newly
//! committed frame ranges from publication logs into linked image logs,
//! recomputes flow-control windows, and reaps silent images and clients.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::buffer::frame::align_frame_length;
use crate::buffer::position::index_by_term_count;
use crate::buffer::reader::committed_frame_at;
use crate::buffer::LogBuffer;
use crate::client::command::{epoch_ms, Command, ControlMode, Response};
use crate::config::DriverConfig;
use crate::driver::destination::{Destination, DestinationRegistry};
use crate::driver::uri::ChannelUri;
use crate::error::ErrorCode;
use crate::flow::{DestinationEvent, FlowControl, FlowControlStrategy};

/// Media identifier of the in-process transport
pub const MEDIA_MEM: &str = "mem";

struct ClientSession {
    response_tx: UnboundedSender<Response>,
    last_keepalive_ms: i64,
}

struct DriverImage {
    image_id: i64,
    subscription_id: i64,
    client_id: i64,
    log: Arc<LogBuffer>,
    subscriber_position: Arc<AtomicI64>,
    /// High-water mark of frames written into the image log
    rebuild_position: i64,
    last_activity_ms: i64,
}

struct DriverPublication {
    registration_id: i64,
    client_id: i64,
    channel: String,
    stream_id: i32,
    session_id: i32,
    control_mode: ControlMode,
    control_key: Option<String>,
    tags: Vec<String>,
    log: Arc<LogBuffer>,
    flow: FlowControl,
    destinations: DestinationRegistry,
    /// Subscription registration id -> mirrored image
    images: HashMap<i64, DriverImage>,
}

struct DriverSubscription {
    registration_id: i64,
    client_id: i64,
    stream_id: i32,
    endpoint: Option<String>,
    control_key: Option<String>,
}

#[derive(Clone)]
struct SubscriptionInfo {
    registration_id: i64,
    client_id: i64,
    stream_id: i32,
    endpoint: Option<String>,
    control_key: Option<String>,
}

/// Driver-side conductor; owned by [`MediaDriver`](crate::driver::MediaDriver)
/// and stepped by its duty cycle
pub struct DriverConductor {
    config: DriverConfig,
    commands: UnboundedReceiver<Command>,
    clients: HashMap<i64, ClientSession>,
    publications: HashMap<i64, DriverPublication>,
    subscriptions: HashMap<i64, DriverSubscription>,
    next_session_id: i32,
    next_correlation_id: i64,
    heartbeat: Arc<AtomicI64>,
}

impl DriverConductor {
    /// Build a conductor draining the given command queue
    pub fn new(
        config: DriverConfig,
        commands: UnboundedReceiver<Command>,
        heartbeat: Arc<AtomicI64>,
    ) -> Self {
        heartbeat.store(epoch_ms(), Ordering::Release);
        Self {
            config,
            commands,
            clients: HashMap::new(),
            publications: HashMap::new(),
            subscriptions: HashMap::new(),
            next_session_id: 0,
            next_correlation_id: 0,
            heartbeat,
        }
    }

    /// Register a client's response channel
    pub fn add_client(&mut self, client_id: i64, response_tx: UnboundedSender<Response>) {
        tracing::info!(client_id = client_id, "Client attached");
        self.clients.insert(
            client_id,
            ClientSession {
                response_tx,
                last_keepalive_ms: epoch_ms(),
            },
        );
    }

    /// One duty cycle; returns an indication of work done
    pub fn do_work(&mut self) -> usize {
        self.heartbeat.store(epoch_ms(), Ordering::Release);

        let mut work_count = 0;
        while let Ok(command) = self.commands.try_recv() {
            self.on_command(command);
            work_count += 1;
        }
        work_count += self.pump_publications();
        self.update_flow_control();
        work_count += self.cleanup();
        work_count
    }

    fn respond(&self, client_id: i64, response: Response) {
        if let Some(client) = self.clients.get(&client_id) {
            let _ = client.response_tx.send(response);
        }
    }

    fn respond_error(&self, client_id: i64, correlation_id: i64, code: ErrorCode, message: String) {
        tracing::warn!(
            client_id = client_id,
            correlation_id = correlation_id,
            code = %code,
            message = %message,
            "Command rejected"
        );
        self.respond(
            client_id,
            Response::Error {
                correlation_id,
                code,
                message,
            },
        );
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::AddPublication {
                correlation_id,
                client_id,
                channel,
                stream_id,
                exclusive,
            } => self.on_add_publication(correlation_id, client_id, channel, stream_id, exclusive),
            Command::ClosePublication {
                correlation_id,
                client_id,
                registration_id,
            } => self.on_close_publication(correlation_id, client_id, registration_id),
            Command::AddSubscription {
                correlation_id,
                client_id,
                channel,
                stream_id,
            } => self.on_add_subscription(correlation_id, client_id, channel, stream_id),
            Command::CloseSubscription {
                correlation_id,
                client_id,
                registration_id,
            } => self.on_close_subscription(correlation_id, client_id, registration_id),
            Command::AddDestination {
                correlation_id,
                client_id,
                publication_id,
                channel,
            } => self.on_add_destination(correlation_id, client_id, publication_id, channel),
            Command::RemoveDestination {
                correlation_id,
                client_id,
                publication_id,
                destination_id,
            } => self.on_remove_destination(correlation_id, client_id, publication_id, destination_id),
            Command::ClientKeepalive { client_id } => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.last_keepalive_ms = epoch_ms();
                }
            }
            Command::ClientClose { client_id } => self.purge_client(client_id),
        }
    }

    fn on_add_publication(
        &mut self,
        correlation_id: i64,
        client_id: i64,
        channel: String,
        stream_id: i32,
        exclusive: bool,
    ) {
        let uri = match ChannelUri::parse(&channel) {
            Ok(uri) => uri,
            Err(message) => {
                return self.respond_error(client_id, correlation_id, ErrorCode::InvalidChannel, message)
            }
        };
        if uri.media() != MEDIA_MEM {
            return self.respond_error(
                client_id,
                correlation_id,
                ErrorCode::InvalidChannel,
                format!("unsupported media '{}'", uri.media()),
            );
        }
        let control_mode = match uri.control_mode() {
            Ok(mode) => mode,
            Err(message) => {
                return self.respond_error(client_id, correlation_id, ErrorCode::InvalidChannel, message)
            }
        };
        match control_mode {
            ControlMode::None if uri.endpoint().is_none() => {
                return self.respond_error(
                    client_id,
                    correlation_id,
                    ErrorCode::InvalidChannel,
                    "publication requires an endpoint or a control-mode".to_string(),
                );
            }
            ControlMode::Dynamic if uri.control().is_none() => {
                return self.respond_error(
                    client_id,
                    correlation_id,
                    ErrorCode::InvalidChannel,
                    "dynamic control-mode requires a control key".to_string(),
                );
            }
            _ => {}
        }

        self.next_session_id += 1;
        let session_id = self.next_session_id;
        let log = Arc::new(LogBuffer::new(
            self.config.term_buffer_length,
            0,
            session_id,
            stream_id,
            self.config.mtu_length,
        ));

        let strategy =
            FlowControlStrategy::from_param(uri.flow_control(), control_mode != ControlMode::None);
        let mut publication = DriverPublication {
            registration_id: correlation_id,
            client_id,
            channel: channel.clone(),
            stream_id,
            session_id,
            control_mode,
            control_key: uri.control().map(str::to_string),
            tags: uri.tags().iter().map(|t| t.to_string()).collect(),
            log: Arc::clone(&log),
            flow: FlowControl::new(strategy),
            destinations: DestinationRegistry::new(),
            images: HashMap::new(),
        };

        // plain endpoint publications carry one implicit destination
        if control_mode == ControlMode::None {
            let endpoint = uri.endpoint().unwrap().to_string();
            publication
                .destinations
                .add(Destination::new(correlation_id, channel.clone(), endpoint, false));
            publication
                .flow
                .on_destination_event(DestinationEvent::Added(correlation_id));
        }

        tracing::info!(
            registration_id = correlation_id,
            client_id = client_id,
            stream_id = stream_id,
            session_id = session_id,
            control_mode = %control_mode,
            exclusive = exclusive,
            tags = ?publication.tags,
            channel = %channel,
            "Publication created"
        );

        self.publications.insert(correlation_id, publication);
        self.respond(
            client_id,
            Response::PublicationReady {
                correlation_id,
                registration_id: correlation_id,
                session_id,
                stream_id,
                control_mode,
                log,
            },
        );
        self.wire_publication(correlation_id);
    }

    fn on_close_publication(&mut self, correlation_id: i64, client_id: i64, registration_id: i64) {
        match self.remove_publication(registration_id) {
            true => self.respond(client_id, Response::OperationSuccess { correlation_id }),
            false => self.respond_error(
                client_id,
                correlation_id,
                ErrorCode::UnknownPublication,
                format!("unknown publication {}", registration_id),
            ),
        }
    }

    fn on_add_subscription(
        &mut self,
        correlation_id: i64,
        client_id: i64,
        channel: String,
        stream_id: i32,
    ) {
        let uri = match ChannelUri::parse(&channel) {
            Ok(uri) => uri,
            Err(message) => {
                return self.respond_error(client_id, correlation_id, ErrorCode::InvalidChannel, message)
            }
        };
        if uri.media() != MEDIA_MEM {
            return self.respond_error(
                client_id,
                correlation_id,
                ErrorCode::InvalidChannel,
                format!("unsupported media '{}'", uri.media()),
            );
        }
        if uri.endpoint().is_none() && uri.control().is_none() {
            return self.respond_error(
                client_id,
                correlation_id,
                ErrorCode::InvalidChannel,
                "subscription requires an endpoint or a control key".to_string(),
            );
        }

        let subscription = DriverSubscription {
            registration_id: correlation_id,
            client_id,
            stream_id,
            endpoint: uri.endpoint().map(str::to_string),
            control_key: uri.control().map(str::to_string),
        };
        tracing::info!(
            registration_id = correlation_id,
            client_id = client_id,
            stream_id = stream_id,
            channel = %channel,
            "Subscription created"
        );
        self.subscriptions.insert(correlation_id, subscription);
        self.respond(
            client_id,
            Response::SubscriptionReady {
                correlation_id,
                registration_id: correlation_id,
            },
        );

        let info = self.subscription_info(correlation_id).unwrap();
        let publication_ids: Vec<i64> = self.publications.keys().copied().collect();
        for publication_id in publication_ids {
            self.wire_one(publication_id, &info);
        }
    }

    fn on_close_subscription(&mut self, correlation_id: i64, client_id: i64, registration_id: i64) {
        if self.subscriptions.remove(&registration_id).is_none() {
            return self.respond_error(
                client_id,
                correlation_id,
                ErrorCode::UnknownSubscription,
                format!("unknown subscription {}", registration_id),
            );
        }
        self.strip_subscription_images(registration_id);
        tracing::info!(registration_id = registration_id, "Subscription closed");
        self.respond(client_id, Response::OperationSuccess { correlation_id });
    }

    fn on_add_destination(
        &mut self,
        correlation_id: i64,
        client_id: i64,
        publication_id: i64,
        channel: String,
    ) {
        let Some(publication) = self.publications.get(&publication_id) else {
            return self.respond_error(
                client_id,
                correlation_id,
                ErrorCode::UnknownPublication,
                format!("unknown publication {}", publication_id),
            );
        };
        if publication.control_mode != ControlMode::Manual {
            let mode = publication.control_mode;
            return self.respond_error(
                client_id,
                correlation_id,
                ErrorCode::NotSupported,
                format!("control mode '{}' does not allow manual destinations", mode),
            );
        }
        let uri = match ChannelUri::parse(&channel) {
            Ok(uri) => uri,
            Err(message) => {
                return self.respond_error(client_id, correlation_id, ErrorCode::InvalidChannel, message)
            }
        };
        let Some(endpoint) = uri.endpoint().map(str::to_string) else {
            return self.respond_error(
                client_id,
                correlation_id,
                ErrorCode::InvalidChannel,
                "destination requires an endpoint".to_string(),
            );
        };

        let publication = self.publications.get_mut(&publication_id).unwrap();
        publication
            .destinations
            .add(Destination::new(correlation_id, channel, endpoint.clone(), true));
        publication
            .flow
            .on_destination_event(DestinationEvent::Added(correlation_id));
        tracing::info!(
            publication_id = publication_id,
            destination_id = correlation_id,
            endpoint = %endpoint,
            "Destination added"
        );
        self.respond(client_id, Response::OperationSuccess { correlation_id });
        self.wire_publication(publication_id);
    }

    fn on_remove_destination(
        &mut self,
        correlation_id: i64,
        client_id: i64,
        publication_id: i64,
        destination_id: i64,
    ) {
        let Some(publication) = self.publications.get_mut(&publication_id) else {
            return self.respond_error(
                client_id,
                correlation_id,
                ErrorCode::UnknownPublication,
                format!("unknown publication {}", publication_id),
            );
        };
        match publication.destinations.remove_by_id(destination_id) {
            Some(destination) => {
                publication
                    .flow
                    .on_destination_event(DestinationEvent::Removed(destination_id));
                tracing::info!(
                    publication_id = publication_id,
                    destination_id = destination_id,
                    endpoint = %destination.endpoint(),
                    "Destination removed"
                );
                self.respond(client_id, Response::OperationSuccess { correlation_id });
            }
            None => self.respond_error(
                client_id,
                correlation_id,
                ErrorCode::UnknownDestination,
                format!("unknown destination {}", destination_id),
            ),
        }
    }

    fn subscription_info(&self, registration_id: i64) -> Option<SubscriptionInfo> {
        self.subscriptions.get(&registration_id).map(|s| SubscriptionInfo {
            registration_id: s.registration_id,
            client_id: s.client_id,
            stream_id: s.stream_id,
            endpoint: s.endpoint.clone(),
            control_key: s.control_key.clone(),
        })
    }

    /// Re-evaluate one publication against every subscription
    fn wire_publication(&mut self, publication_id: i64) {
        let infos: Vec<SubscriptionInfo> = self
            .subscriptions
            .keys()
            .filter_map(|id| self.subscription_info(*id))
            .collect();
        for info in &infos {
            self.wire_one(publication_id, info);
        }
    }

    /// Create/link the image joining one publication and one subscription,
    /// if their endpoints (or dynamic control keys) match
    fn wire_one(&mut self, publication_id: i64, sub: &SubscriptionInfo) {
        let now_ms = epoch_ms();
        let Some(publication) = self.publications.get_mut(&publication_id) else {
            return;
        };
        if publication.stream_id != sub.stream_id {
            return;
        }
        let Some(endpoint) = sub.endpoint.as_deref() else {
            return;
        };

        // dynamic publications derive a destination per discovered endpoint
        if publication.control_mode == ControlMode::Dynamic
            && publication.control_key.is_some()
            && publication.control_key == sub.control_key
            && !publication.destinations.has_endpoint(endpoint)
        {
            self.next_correlation_id += 1;
            let destination_id = self.next_correlation_id;
            publication.destinations.add(Destination::new(
                destination_id,
                format!("bus:{}?endpoint={}", MEDIA_MEM, endpoint),
                endpoint.to_string(),
                false,
            ));
            publication
                .flow
                .on_destination_event(DestinationEvent::Added(destination_id));
            tracing::info!(
                publication_id = publication_id,
                destination_id = destination_id,
                endpoint = %endpoint,
                "Dynamic destination discovered"
            );
        }

        if !publication.destinations.has_endpoint(endpoint) {
            return;
        }

        // one image per (publication, subscription); later destinations
        // attach to it at its current high-water mark
        if !publication.images.contains_key(&sub.registration_id) {
            self.next_correlation_id += 1;
            let image_id = self.next_correlation_id;
            let join_position = publication.log.position();
            let image_log = Arc::new(LogBuffer::new(
                publication.log.term_length(),
                publication.log.initial_term_id(),
                publication.session_id,
                publication.stream_id,
                self.config.mtu_length,
            ));
            let subscriber_position = Arc::new(AtomicI64::new(join_position));
            publication.images.insert(
                sub.registration_id,
                DriverImage {
                    image_id,
                    subscription_id: sub.registration_id,
                    client_id: sub.client_id,
                    log: Arc::clone(&image_log),
                    subscriber_position: Arc::clone(&subscriber_position),
                    rebuild_position: join_position,
                    last_activity_ms: now_ms,
                },
            );
            tracing::info!(
                publication_id = publication_id,
                subscription_id = sub.registration_id,
                image_id = image_id,
                join_position = join_position,
                "Image created"
            );
            if let Some(client) = self.clients.get(&sub.client_id) {
                let _ = client.response_tx.send(Response::AvailableImage {
                    correlation_id: image_id,
                    subscription_registration_id: sub.registration_id,
                    session_id: publication.session_id,
                    source_identity: publication.channel.clone(),
                    log: image_log,
                    subscriber_position,
                    join_position,
                });
            }
        }
        let image = &publication.images[&sub.registration_id];
        let (image_id, link_position) = (image.image_id, image.rebuild_position);

        for destination in publication.destinations.iter_mut() {
            if destination.endpoint() == endpoint {
                destination.link_image(image_id, link_position);
            }
        }
    }

    /// Ship newly committed frames from publication logs into image logs
    fn pump_publications(&mut self) -> usize {
        let now_ms = epoch_ms();
        let mut work_count = 0;

        for publication in self.publications.values_mut() {
            let DriverPublication {
                destinations,
                images,
                log,
                ..
            } = publication;

            let mut images_by_id: HashMap<i64, &mut DriverImage> = images
                .values_mut()
                .map(|image| (image.image_id, image))
                .collect();

            for destination in destinations.iter_mut() {
                for (image_id, replicate_position) in destination.links_mut() {
                    if let Some(image) = images_by_id.get_mut(image_id) {
                        work_count +=
                            replicate_into_image(log, &mut **image, replicate_position, now_ms);
                    }
                }
            }
        }

        work_count
    }

    /// Recompute every publication's window and connection status
    fn update_flow_control(&mut self) {
        let window = self.config.initial_window_length as i64;
        for publication in self.publications.values_mut() {
            let positions_by_image: HashMap<i64, i64> = publication
                .images
                .values()
                .map(|image| {
                    (
                        image.image_id,
                        image.subscriber_position.load(Ordering::Acquire),
                    )
                })
                .collect();

            let mut receiver_positions = Vec::new();
            for destination in publication.destinations.iter() {
                let gate = destination
                    .linked_images()
                    .filter_map(|id| positions_by_image.get(&id))
                    .copied()
                    .min();
                if let Some(position) = gate {
                    receiver_positions.push(position);
                }
            }

            let sender_position = publication.log.position();
            let limit =
                publication
                    .flow
                    .compute_window(&receiver_positions, sender_position, window);
            publication.log.set_position_limit(limit);
            publication.log.set_connected(!publication.images.is_empty());
        }
    }

    /// Reap silent images and dead clients
    fn cleanup(&mut self) -> usize {
        let now_ms = epoch_ms();
        let mut work_count = 0;

        let image_timeout_ms = self.config.image_liveness_timeout.as_millis() as i64;
        let mut unavailable: Vec<(i64, i64, i64)> = Vec::new();
        for publication in self.publications.values_mut() {
            let linked: HashSet<i64> = publication
                .destinations
                .iter()
                .flat_map(|d| d.linked_images().collect::<Vec<_>>())
                .collect();
            let stale: Vec<i64> = publication
                .images
                .iter()
                .filter(|(_, image)| {
                    !linked.contains(&image.image_id)
                        && now_ms - image.last_activity_ms > image_timeout_ms
                })
                .map(|(subscription_id, _)| *subscription_id)
                .collect();
            for subscription_id in stale {
                let image = publication.images.remove(&subscription_id).unwrap();
                tracing::info!(
                    image_id = image.image_id,
                    subscription_id = subscription_id,
                    "Image timed out, now unavailable"
                );
                unavailable.push((image.client_id, image.image_id, image.subscription_id));
                work_count += 1;
            }
        }
        for (client_id, image_id, subscription_id) in unavailable {
            self.respond(
                client_id,
                Response::UnavailableImage {
                    correlation_id: image_id,
                    subscription_registration_id: subscription_id,
                },
            );
        }

        let client_timeout_ms = self.config.client_liveness_timeout.as_millis() as i64;
        let dead_clients: Vec<i64> = self
            .clients
            .iter()
            .filter(|(_, session)| now_ms - session.last_keepalive_ms > client_timeout_ms)
            .map(|(id, _)| *id)
            .collect();
        for client_id in dead_clients {
            tracing::warn!(client_id = client_id, "Client timed out");
            self.purge_client(client_id);
            work_count += 1;
        }

        work_count
    }

    fn purge_client(&mut self, client_id: i64) {
        if self.clients.remove(&client_id).is_none() {
            return;
        }
        tracing::info!(client_id = client_id, "Client detached");

        let owned_publications: Vec<i64> = self
            .publications
            .values()
            .filter(|p| p.client_id == client_id)
            .map(|p| p.registration_id)
            .collect();
        for registration_id in owned_publications {
            self.remove_publication(registration_id);
        }

        let owned_subscriptions: Vec<i64> = self
            .subscriptions
            .values()
            .filter(|s| s.client_id == client_id)
            .map(|s| s.registration_id)
            .collect();
        for registration_id in owned_subscriptions {
            self.subscriptions.remove(&registration_id);
            self.strip_subscription_images(registration_id);
        }
    }

    fn remove_publication(&mut self, registration_id: i64) -> bool {
        let Some(publication) = self.publications.remove(&registration_id) else {
            return false;
        };
        tracing::info!(registration_id = registration_id, "Publication closed");
        for image in publication.images.values() {
            self.respond(
                image.client_id,
                Response::UnavailableImage {
                    correlation_id: image.image_id,
                    subscription_registration_id: image.subscription_id,
                },
            );
        }
        true
    }

    fn strip_subscription_images(&mut self, subscription_id: i64) {
        for publication in self.publications.values_mut() {
            if let Some(image) = publication.images.remove(&subscription_id) {
                for destination in publication.destinations.iter_mut() {
                    destination.unlink_image(image.image_id);
                }
            }
        }
    }
}

/// Copy committed frames from the publication log into an image log,
/// frame by frame, publishing each length word last so image readers see
/// only whole frames. Idempotent across overlapping destinations because
/// both write identical words at identical offsets.
fn replicate_into_image(
    publication_log: &Arc<LogBuffer>,
    image: &mut DriverImage,
    replicate_position: &mut i64,
    now_ms: i64,
) -> usize {
    let term_length = publication_log.term_length();
    let bits = publication_log.position_bits();
    let initial_term_id = publication_log.initial_term_id();
    let mut frames_shipped = 0;

    // bound one cycle's work per link to a term's worth of bytes
    let budget_end = *replicate_position + term_length as i64;

    while *replicate_position < budget_end {
        let position = *replicate_position;
        let subscriber_position = image.subscriber_position.load(Ordering::Acquire);
        // never wrap into a term partition the consumer may still be reading
        if position - subscriber_position >= 2 * term_length as i64 {
            break;
        }

        let term_count = position >> bits;
        let index = index_by_term_count(term_count);
        let term_offset = (position & ((1i64 << bits) - 1)) as usize;
        let expected_term_id = initial_term_id + term_count as i32;

        let source_term = publication_log.term(index);
        let image_term = image.log.term(index);

        // recycle the image partition before writing the first frame of a
        // new term into it
        if term_offset == 0 && image_term.get_i32_volatile(0) != 0 {
            image_term.zero_range(0, term_length);
        }

        let Some(frame_length) = committed_frame_at(source_term, term_offset, expected_term_id)
        else {
            break;
        };
        let aligned = align_frame_length(frame_length as usize);

        image_term.copy_words(term_offset + 4, source_term, term_offset + 4, aligned - 4);
        image_term.put_i32_ordered(term_offset, frame_length);

        *replicate_position += aligned as i64;
        image.rebuild_position = image.rebuild_position.max(*replicate_position);
        image.last_activity_ms = now_ms;
        frames_shipped += 1;
    }

    frames_shipped
}
