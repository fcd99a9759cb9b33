//! CoAP over UDP transport for a [`Site`].
//!
//! The server decodes datagrams, routes requests through the site, keeps the
//! observer registry and forwards observer count changes to the resources.
//! Each request is handled on its own task, so a slow validator call on one
//! request never holds up the others.

mod client;

pub use client::{Client, ClientError};

use crate::coap::{option, CoapOption, Code, Message, MessageType};
use crate::observe::{ObserverKey, ObserverRegistry};
use crate::resource::{Request, Resource, Response, Site};
use crate::token::Action;
use futures::future::join_all;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Largest datagram the server accepts
pub const MAX_DATAGRAM_SIZE: usize = 1152;

// Large enough for any UDP payload, so oversized datagrams are seen whole
// instead of being cut down to something that still decodes
const RECV_BUFFER_SIZE: usize = 65_536;

pub struct ResourceServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    socket: UdpSocket,
    site: Site,
    observers: Mutex<ObserverRegistry>,
    message_ids: AtomicU16,
}

impl ResourceServer {
    pub async fn bind(addr: SocketAddr, site: Site) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Listening on {}", socket.local_addr()?);
        if site.is_empty() {
            warn!("Serving an empty resource tree");
        }

        Ok(Self {
            inner: Arc::new(ServerInner {
                socket,
                site,
                observers: Mutex::new(ObserverRegistry::new()),
                message_ids: AtomicU16::new(initial_message_id()),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Serve until `shutdown` completes
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let forwarders = self.spawn_notification_forwarders();
        tokio::pin!(shutdown);

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let result = loop {
            tokio::select! {
                received = self.inner.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => {
                            let inner = Arc::clone(&self.inner);
                            let datagram = buf[..len].to_vec();
                            tokio::spawn(async move { inner.handle_datagram(datagram, peer).await });
                        }
                        // ICMP errors from earlier sends surface here on some platforms
                        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                            debug!("Ignoring connection reset: {}", e);
                        }
                        Err(e) => break Err(e),
                    }
                }
                _ = &mut shutdown => break Ok(()),
            }
        };

        for forwarder in forwarders {
            forwarder.abort();
        }
        for (_, resource) in self.inner.site.observable() {
            resource.update_observation_count(0);
        }
        info!("Server shutting down");
        result
    }

    fn spawn_notification_forwarders(&self) -> Vec<JoinHandle<()>> {
        self.inner
            .site
            .observable()
            .into_iter()
            .filter_map(|(path, resource)| {
                let mut events = resource.observations()?;
                let inner = Arc::clone(&self.inner);
                Some(tokio::spawn(async move {
                    loop {
                        match events.recv().await {
                            Ok(event) => {
                                debug!(
                                    path = %event.path,
                                    sequence = event.sequence,
                                    "Notifying observers"
                                );
                                inner.notify_observers(&path, &resource).await;
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(path = %path, "Skipped {} observation ticks", skipped);
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }))
            })
            .collect()
    }
}

impl ServerInner {
    fn next_message_id(&self) -> u16 {
        self.message_ids.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, message: &Message, peer: SocketAddr) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode message for {}: {}", peer, e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, peer).await {
            warn!("Failed to send to {}: {}", peer, e);
        }
    }

    async fn handle_datagram(&self, datagram: Vec<u8>, peer: SocketAddr) {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            self.reject_oversized(&datagram, peer).await;
            return;
        }

        let message = match Message::decode(&datagram) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed datagram from {}: {}", peer, e);
                self.reset_confirmable(&datagram, peer).await;
                return;
            }
        };

        match message.message_type {
            MessageType::Reset => self.handle_reset(&message, peer).await,
            MessageType::Acknowledgement => {}
            MessageType::Confirmable if message.code.is_empty() => {
                // CoAP ping
                self.send(&Message::reset(message.message_id), peer).await;
            }
            MessageType::Confirmable | MessageType::NonConfirmable => {
                if message.code.is_request() {
                    let span = tracing::info_span!(
                        "request",
                        %peer,
                        code = %message.code,
                        mid = message.message_id
                    );
                    self.handle_request(message, peer).instrument(span).await;
                }
            }
        }
    }

    /// A confirmable message we cannot parse is answered with RST
    async fn reset_confirmable(&self, datagram: &[u8], peer: SocketAddr) {
        if datagram.len() >= 4 && (datagram[0] >> 4) & 0b11 == 0 {
            let message_id = u16::from_be_bytes([datagram[2], datagram[3]]);
            self.send(&Message::reset(message_id), peer).await;
        }
    }

    /// Requests over the size limit get 4.13 with the limit in Size1. They
    /// never reach the site.
    async fn reject_oversized(&self, datagram: &[u8], peer: SocketAddr) {
        warn!(%peer, len = datagram.len(), "Rejecting oversized datagram");
        match Message::decode(datagram) {
            Ok(message)
                if message.code.is_request()
                    && matches!(
                        message.message_type,
                        MessageType::Confirmable | MessageType::NonConfirmable
                    ) =>
            {
                let mut reply = self.reply_to(&message, Code::REQUEST_ENTITY_TOO_LARGE);
                reply.add_option(CoapOption::uint(option::SIZE1, MAX_DATAGRAM_SIZE as u32));
                self.send(&reply, peer).await;
            }
            _ => self.reset_confirmable(datagram, peer).await,
        }
    }

    async fn handle_reset(&self, message: &Message, peer: SocketAddr) {
        let mut observers = self.observers.lock().await;
        let removed = observers.deregister_by_message_id(peer, message.message_id);

        if let Some((path, count)) = removed {
            info!(%peer, path = %path, "Observer reset notification");
            self.update_count(&path, count);
        }
    }

    /// Piggy-backed ACK for a confirmable request, NON otherwise
    fn reply_to(&self, request: &Message, code: Code) -> Message {
        let reply = match request.message_type {
            MessageType::Confirmable => {
                Message::new(MessageType::Acknowledgement, code, request.message_id)
            }
            _ => Message::new(MessageType::NonConfirmable, code, self.next_message_id()),
        };
        reply.with_token(request.token.clone())
    }

    async fn handle_request(&self, message: Message, peer: SocketAddr) {
        let response = self.dispatch(&message, peer).await;

        let mut reply = self
            .reply_to(&message, response.code)
            .with_payload(response.response.payload);

        if let Some(format) = response.response.content_format {
            reply.set_content_format(format);
        }
        if let Some(sequence) = response.observe {
            reply.set_observe(sequence);
        }

        debug!(code = %reply.code, "Responding");
        self.send(&reply, peer).await;
    }

    async fn dispatch(&self, message: &Message, peer: SocketAddr) -> Dispatched {
        if let Some(number) = message.unrecognized_critical_option() {
            debug!("Unrecognized critical option {}", number);
            return Dispatched::plain(Response::new(Code::BAD_OPTION));
        }

        let Some(method) = message.code.action() else {
            return Dispatched::plain(Response::method_not_allowed());
        };
        let Some(path) = message.uri_path() else {
            return Dispatched::plain(Response::new(Code::BAD_REQUEST));
        };

        let request = Request {
            method,
            path,
            body: message.payload.clone(),
            correlation_id: Uuid::new_v4(),
        };
        let response = self.site.render(&request).await;

        let observe = match (method, message.observe()) {
            (Action::Get, Some(flag)) => {
                self.handle_observe(flag, &request, &response, message, peer)
                    .await
            }
            _ => None,
        };

        Dispatched {
            code: response.code,
            response,
            observe,
        }
    }

    /// Register or deregister an observation. Returns the Observe value to put
    /// on the response if the peer is (still) registered.
    async fn handle_observe(
        &self,
        flag: u32,
        request: &Request,
        response: &Response,
        message: &Message,
        peer: SocketAddr,
    ) -> Option<u32> {
        let resource = self.site.get(&request.path)?;
        if !resource.is_observable() {
            return None;
        }

        let path = request.path_string();
        let key = ObserverKey::new(peer, message.token.clone());
        // Counts reach the resource while the registry is still locked, so
        // they arrive in the order the registry changed
        let mut observers = self.observers.lock().await;

        if flag == option::OBSERVE_REGISTER && response.is_success() {
            let (count, sequence) = observers.register(&path, key, request.clone());
            info!(path = %path, count, "Observer registered");
            resource.update_observation_count(count);
            Some(sequence)
        } else {
            // Explicit deregistration, or a failed registration ends any
            // earlier observation with the same token
            let count = observers.deregister(&path, &key);
            if let Some(count) = count {
                info!(path = %path, count, "Observer deregistered");
                resource.update_observation_count(count);
            }
            None
        }
    }

    /// Callers hold the registry lock
    fn update_count(&self, path: &str, count: usize) {
        let segments: Vec<String> = path.split('/').map(str::to_string).collect();
        if let Some(resource) = self.site.get(&segments) {
            resource.update_observation_count(count);
        }
    }

    /// Re-render the resource for every observer and push the result.
    /// Observers whose request no longer succeeds get the error and are
    /// dropped.
    async fn notify_observers(&self, path: &str, resource: &Arc<dyn Resource>) {
        let observers = self.observers.lock().await.observers(path);
        if observers.is_empty() {
            return;
        }

        let rendered = join_all(observers.into_iter().map(|(key, request)| {
            let resource = Arc::clone(resource);
            async move {
                let response = resource.render_get(&request).await;
                (key, response)
            }
        }))
        .await;

        for (key, response) in rendered {
            let message_id = self.next_message_id();
            let mut notification =
                Message::new(MessageType::NonConfirmable, response.code, message_id)
                    .with_token(key.token.clone())
                    .with_payload(response.payload.clone());
            if let Some(format) = response.content_format {
                notification.set_content_format(format);
            }

            if response.is_success() {
                let sequence = self
                    .observers
                    .lock()
                    .await
                    .next_sequence(path, &key, message_id);
                // Deregistered while rendering
                let Some(sequence) = sequence else { continue };
                notification.set_observe(sequence);
                self.send(&notification, key.peer).await;
            } else {
                let removed = {
                    let mut observers = self.observers.lock().await;
                    let count = observers.deregister(path, &key);
                    if let Some(count) = count {
                        self.update_count(path, count);
                    }
                    count.is_some()
                };
                // Deregistered while rendering
                if !removed {
                    continue;
                }
                warn!(
                    peer = %key.peer,
                    path = %path,
                    code = %response.code,
                    "Ending observation"
                );
                self.send(&notification, key.peer).await;
            }
        }
    }
}

struct Dispatched {
    code: Code,
    response: Response,
    observe: Option<u32>,
}

impl Dispatched {
    fn plain(response: Response) -> Self {
        Self {
            code: response.code,
            response,
            observe: None,
        }
    }
}

fn initial_message_id() -> u16 {
    (Uuid::new_v4().as_u128() & 0xffff) as u16
}
