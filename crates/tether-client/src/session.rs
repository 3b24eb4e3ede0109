//! Sessions: one exclusive connection to one device service.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tether_core::Message;
use tether_protocol::{MessageStream, ProtocolError};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::device::{BoxedConnection, Connection, Connector, DeviceRef, Lockdown, ServiceDescriptor};
use crate::error::{ClientError, ClientResult};

type SharedStream = Arc<Mutex<MessageStream<BoxedConnection>>>;

struct Link {
    stream: SharedStream,
    closed: watch::Sender<bool>,
    desynchronized: Arc<AtomicBool>,
}

/// An open connection to a device service.
///
/// A session carries one exchange at a time. Starting a second one while
/// the first is in flight fails with [`ClientError::InvalidState`] instead
/// of interleaving frames.
///
/// An exchange that ends without its reply being read (a timeout, a
/// transport failure, a cancelled call or an operation dropped before its
/// terminal status) leaves the session desynchronized. Every later call
/// then fails with [`ClientError::InvalidState`] until the session is
/// closed.
pub struct Session {
    id: Uuid,
    service: String,
    label: Option<String>,
    config: ClientConfig,
    link: Option<Link>,
}

impl Session {
    /// Connects to a service that is already running.
    pub async fn open(
        connector: &dyn Connector,
        device: &DeviceRef,
        descriptor: &ServiceDescriptor,
        service: impl Into<String>,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        descriptor.validate()?;
        let service = service.into();
        let timeout = config.io_timeout();

        debug!(device = %device.udid(), service = %service, port = descriptor.port, "opening session");

        let connection = tokio::time::timeout(timeout, connector.connect(device, descriptor))
            .await
            .map_err(|_| {
                ClientError::ConnectionFailed(format!(
                    "connection to {} timed out after {}s",
                    service,
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                ClientError::ConnectionFailed(format!(
                    "failed to connect to {} on port {}: {}",
                    service, descriptor.port, e
                ))
            })?;

        Ok(Self::from_boxed(connection, service, config))
    }

    /// Asks lockdown to start `service_name`, then connects to it.
    ///
    /// An empty label is treated as no label. Without one, the configured
    /// default label is used.
    pub async fn start_and_open(
        lockdown: &dyn Lockdown,
        connector: &dyn Connector,
        device: &DeviceRef,
        service_name: &str,
        label: Option<&str>,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        if service_name.is_empty() {
            return Err(ClientError::invalid_argument("service name is empty"));
        }
        let label = label
            .or(config.label.as_deref())
            .filter(|l| !l.is_empty())
            .map(str::to_string);

        let descriptor = lockdown
            .start_service(device, service_name, label.as_deref())
            .await?;
        debug!(service = %service_name, port = descriptor.port, ssl = descriptor.ssl_enabled, "service started");

        let mut session = Self::open(connector, device, &descriptor, service_name, config).await?;
        session.label = label;
        Ok(session)
    }

    /// Wraps a connection that was opened elsewhere.
    pub fn attach(connection: impl Connection, service: impl Into<String>, config: ClientConfig) -> Self {
        Self::from_boxed(Box::new(connection), service.into(), config)
    }

    fn from_boxed(connection: BoxedConnection, service: String, config: ClientConfig) -> Self {
        let stream = MessageStream::new(connection, config.wire_format)
            .with_max_frame_size(config.max_frame_size);
        let (closed, _) = watch::channel(false);
        let id = Uuid::new_v4();

        info!(session = %id, service = %service, format = ?config.wire_format, "session opened");

        Self {
            id,
            service,
            label: None,
            config,
            link: Some(Link {
                stream: Arc::new(Mutex::new(stream)),
                closed,
                desynchronized: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the service this session talks to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Label the service was started with, if any.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// True once an exchange has left an unread reply on the connection.
    pub fn is_desynchronized(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.desynchronized.load(Ordering::Acquire))
    }

    /// Closes the session.
    ///
    /// Always succeeds and does nothing on a closed session. An operation
    /// still running on this session observes the close on its pending
    /// receive and stops.
    pub async fn close(&mut self) -> ClientResult<()> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };

        link.closed.send_replace(true);

        match link.stream.try_lock() {
            Ok(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    debug!(session = %self.id, error = %e, "shutdown after close failed");
                }
            }
            Err(_) => debug!(session = %self.id, "interrupting exchange in flight"),
        }

        info!(session = %self.id, service = %self.service, "session closed");
        Ok(())
    }

    /// Sends one message.
    pub async fn send(&self, message: &Message) -> ClientResult<()> {
        self.exchange()?.send(message).await
    }

    /// Receives one message, waiting at most the configured status timeout.
    pub async fn receive(&self) -> ClientResult<Message> {
        self.receive_with_timeout(self.config.status_timeout()).await
    }

    /// Receives one message. `None` waits indefinitely.
    pub async fn receive_with_timeout(&self, timeout: Option<Duration>) -> ClientResult<Message> {
        self.exchange()?.receive(timeout).await
    }

    /// Sends `request` and receives exactly one response.
    pub async fn request(&self, request: &Message) -> ClientResult<Message> {
        let mut exchange = self.exchange()?;
        exchange.send(request).await?;
        exchange.receive(Some(self.config.io_timeout())).await
    }

    /// Claims the connection for one exchange.
    pub(crate) fn exchange(&self) -> ClientResult<Exchange> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| ClientError::invalid_state(format!("{} session is closed", self.service)))?;
        if *link.closed.borrow() {
            return Err(ClientError::invalid_state(format!("{} session is closed", self.service)));
        }
        if link.desynchronized.load(Ordering::Acquire) {
            return Err(ClientError::invalid_state(format!(
                "{} session desynchronized; close it",
                self.service
            )));
        }
        let stream = Arc::clone(&link.stream)
            .try_lock_owned()
            .map_err(|_| ClientError::invalid_state("session busy"))?;

        Ok(Exchange {
            session: self.id,
            service: self.service.clone(),
            stream,
            closed: link.closed.subscribe(),
            desynchronized: Arc::clone(&link.desynchronized),
            io_timeout: self.config.io_timeout(),
            in_flight: false,
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("label", &self.label)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.closed.send_replace(true);
        }
    }
}

/// Exclusive use of a session's connection.
///
/// Owns its lock, so it can outlive the borrow of the [`Session`] and move
/// into a spawned task. A receive stops as soon as the session is closed.
///
/// A send or receive that times out, fails in the transport, or is dropped
/// before completing marks the session desynchronized.
pub(crate) struct Exchange {
    session: Uuid,
    service: String,
    stream: OwnedMutexGuard<MessageStream<BoxedConnection>>,
    closed: watch::Receiver<bool>,
    desynchronized: Arc<AtomicBool>,
    io_timeout: Duration,
    in_flight: bool,
}

impl Exchange {
    pub(crate) fn service(&self) -> &str {
        &self.service
    }

    /// Marks the session unusable for further exchanges.
    pub(crate) fn mark_desynchronized(&self, reason: &str) {
        if !self.desynchronized.swap(true, Ordering::AcqRel) {
            warn!(session = %self.session, service = %self.service, reason, "session desynchronized");
        }
    }

    pub(crate) async fn send(&mut self, message: &Message) -> ClientResult<()> {
        if *self.closed.borrow() {
            return Err(ClientError::ConnectionClosed { locally: true });
        }

        self.in_flight = true;
        let sent = tokio::time::timeout(self.io_timeout, self.stream.send(message)).await;
        self.in_flight = false;

        match sent {
            Err(_) => {
                self.mark_desynchronized("send timed out");
                Err(ClientError::Timeout(format!("sending to {}", self.service)))
            }
            Ok(Err(e)) => {
                // Encoding and size checks fail before any byte is written.
                if e.is_transport() {
                    self.mark_desynchronized("send failed");
                }
                Err(e.into())
            }
            Ok(Ok(())) => {
                debug!(session = %self.session, service = %self.service, kind = %message.kind(), "message sent");
                Ok(())
            }
        }
    }

    /// Receives one message. `None` waits indefinitely.
    pub(crate) async fn receive(&mut self, timeout: Option<Duration>) -> ClientResult<Message> {
        let closed = &mut self.closed;
        let stream = &mut self.stream;
        let received = async {
            tokio::select! {
                biased;
                () = wait_closed(closed) => None,
                result = stream.receive() => Some(result),
            }
        };

        self.in_flight = true;
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, received).await,
            None => Ok(received.await),
        };
        self.in_flight = false;

        let result = match outcome {
            Err(_) => {
                self.mark_desynchronized("receive timed out");
                Err(ClientError::Timeout(format!("waiting for {} reply", self.service)))
            }
            Ok(None) => Err(ClientError::ConnectionClosed { locally: true }),
            Ok(Some(Err(e))) => {
                // An oversized frame is rejected after its header was read.
                if e.is_transport() || matches!(e, ProtocolError::FrameTooLarge { .. }) {
                    self.mark_desynchronized("receive failed");
                }
                Err(e.into())
            }
            Ok(Some(Ok(message))) => Ok(message),
        };

        match &result {
            Ok(message) => {
                debug!(session = %self.session, service = %self.service, kind = %message.kind(), "message received");
            }
            Err(e) if e.is_local_close() => {
                debug!(session = %self.session, "receive interrupted by close");
            }
            Err(e) => warn!(session = %self.session, service = %self.service, error = %e, "receive failed"),
        }
        result
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if self.in_flight {
            self.mark_desynchronized("exchange cancelled");
        }
    }
}

/// Resolves once the session signals close, or is dropped.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use tether_protocol::WireFormat;
    use tokio::io::DuplexStream;

    use super::*;

    /// A session wired to an in-memory device peer.
    pub(crate) fn mock_session(format: WireFormat) -> (Session, MessageStream<DuplexStream>) {
        let (client, device) = tokio::io::duplex(64 * 1024);
        let config = ClientConfig::default()
            .with_wire_format(format)
            .with_io_timeout(Duration::from_secs(5));
        let session = Session::attach(client, "com.example.mock", config);
        (session, MessageStream::new(device, format))
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex as StdMutex;

    use tether_protocol::WireFormat;
    use tokio::io::DuplexStream;

    use super::test_support::mock_session;
    use super::*;
    use crate::device::BoxFuture;

    struct MockConnector {
        peer: StdMutex<Option<DuplexStream>>,
    }

    impl MockConnector {
        fn new() -> (Self, DuplexStream) {
            let (client, device) = tokio::io::duplex(4096);
            (
                Self {
                    peer: StdMutex::new(Some(client)),
                },
                device,
            )
        }
    }

    impl Connector for MockConnector {
        fn connect<'a>(
            &'a self,
            _device: &'a DeviceRef,
            _service: &'a ServiceDescriptor,
        ) -> BoxFuture<'a, io::Result<BoxedConnection>> {
            Box::pin(async move {
                match self.peer.lock().unwrap().take() {
                    Some(stream) => Ok(Box::new(stream) as BoxedConnection),
                    None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
                }
            })
        }
    }

    struct MockLockdown {
        labels: StdMutex<Vec<Option<String>>>,
    }

    impl Lockdown for MockLockdown {
        fn start_service<'a>(
            &'a self,
            _device: &'a DeviceRef,
            service_name: &'a str,
            label: Option<&'a str>,
        ) -> BoxFuture<'a, ClientResult<ServiceDescriptor>> {
            self.labels.lock().unwrap().push(label.map(str::to_string));
            Box::pin(async move { Ok(ServiceDescriptor::new(49152).with_identifier(service_name)) })
        }
    }

    fn device() -> DeviceRef {
        DeviceRef::new("00008030-001").unwrap()
    }

    #[tokio::test]
    async fn open_rejects_port_zero() {
        let (connector, _peer) = MockConnector::new();
        let err = Session::open(
            &connector,
            &device(),
            &ServiceDescriptor::new(0),
            "svc",
            ClientConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn open_maps_connect_failure() {
        let (connector, _peer) = MockConnector::new();
        connector.peer.lock().unwrap().take();
        let err = Session::open(
            &connector,
            &device(),
            &ServiceDescriptor::new(1),
            "svc",
            ClientConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClientError::ConnectionFailed(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::CommunicationError);
    }

    #[tokio::test]
    async fn start_and_open_suppresses_empty_label() {
        let (connector, _peer) = MockConnector::new();
        let lockdown = MockLockdown {
            labels: StdMutex::new(Vec::new()),
        };
        let session = Session::start_and_open(
            &lockdown,
            &connector,
            &device(),
            "com.example.svc",
            Some(""),
            ClientConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(*lockdown.labels.lock().unwrap(), vec![None]);
        assert_eq!(session.label(), None);
        assert_eq!(session.service(), "com.example.svc");
    }

    #[tokio::test]
    async fn start_and_open_passes_label() {
        let (connector, _peer) = MockConnector::new();
        let lockdown = MockLockdown {
            labels: StdMutex::new(Vec::new()),
        };
        let session = Session::start_and_open(
            &lockdown,
            &connector,
            &device(),
            "com.example.svc",
            Some("installer"),
            ClientConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(*lockdown.labels.lock().unwrap(), vec![Some("installer".to_string())]);
        assert_eq!(session.label(), Some("installer"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut session, _peer) = mock_session(WireFormat::Xml);
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(!session.is_open());

        let err = session.send(&Message::dictionary()).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn request_consumes_exactly_one_response() {
        let (session, mut peer) = mock_session(WireFormat::Binary);

        let device = tokio::spawn(async move {
            let request = peer.receive().await.unwrap();
            assert_eq!(request.get_str("Command"), Some("Ping"));
            peer.send(&Message::from_pairs([("Reply", 1)])).await.unwrap();
            peer.send(&Message::from_pairs([("Reply", 2)])).await.unwrap();
            peer
        });

        let reply = session
            .request(&Message::from_pairs([("Command", "Ping")]))
            .await
            .unwrap();
        assert_eq!(reply.get("Reply"), Some(&Message::Integer(1)));

        let _peer = device.await.unwrap();
        let next = session.receive().await.unwrap();
        assert_eq!(next.get("Reply"), Some(&Message::Integer(2)));
    }

    #[tokio::test]
    async fn peer_close_is_communication_error() {
        let (session, peer) = mock_session(WireFormat::Xml);
        drop(peer);

        let err = session.receive().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed { locally: false }));
    }

    #[tokio::test]
    async fn garbage_payload_is_protocol_error() {
        use tokio::io::AsyncWriteExt;

        let (client, mut device) = tokio::io::duplex(1024);
        let session = Session::attach(client, "svc", ClientConfig::default());
        device.write_all(&4u32.to_be_bytes()).await.unwrap();
        device.write_all(b"nope").await.unwrap();

        let err = session.receive().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn second_exchange_is_refused_while_busy() {
        let (session, _peer) = mock_session(WireFormat::Xml);
        let held = session.exchange().unwrap();

        let err = session.send(&Message::dictionary()).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(ref m) if m == "session busy"));

        drop(held);
        assert!(session.exchange().is_ok());
    }

    #[tokio::test]
    async fn close_interrupts_pending_receive() {
        let (mut session, _peer) = mock_session(WireFormat::Xml);
        let mut exchange = session.exchange().unwrap();

        let pending = tokio::spawn(async move { exchange.receive(None).await });
        tokio::task::yield_now().await;
        session.close().await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_local_close());
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_never_read_by_next_request() {
        let (client, device) = tokio::io::duplex(4096);
        let config = ClientConfig::default().with_io_timeout(Duration::from_secs(1));
        let mut session = Session::attach(client, "svc", config);
        let mut peer = MessageStream::new(device, WireFormat::Xml);

        let device = tokio::spawn(async move {
            peer.receive().await.unwrap();
            tokio::time::sleep(Duration::from_millis(1500)).await;
            peer.send(&Message::from_pairs([("Reply", "first")])).await.unwrap();
            peer
        });

        let err = session
            .request(&Message::from_pairs([("Command", "First")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        assert!(session.is_desynchronized());

        let _peer = device.await.unwrap();
        let err = session
            .request(&Message::from_pairs([("Command", "Second")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(ref m) if m.contains("desynchronized")));
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);

        session.close().await.unwrap();
        assert!(!session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_desynchronizes_session() {
        let (session, mut peer) = mock_session(WireFormat::Xml);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            session.request(&Message::from_pairs([("Command", "Ping")])),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(peer.receive().await.is_ok());

        let err = session.receive().await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn decode_failure_keeps_session_usable() {
        use tokio::io::AsyncWriteExt;

        let (client, mut device) = tokio::io::duplex(1024);
        let session = Session::attach(client, "svc", ClientConfig::default());
        device.write_all(&4u32.to_be_bytes()).await.unwrap();
        device.write_all(b"nope").await.unwrap();

        assert!(session.receive().await.is_err());
        assert!(!session.is_desynchronized());
        assert!(session.exchange().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn receive_with_timeout_overrides_status_timeout() {
        let (session, _peer) = mock_session(WireFormat::Xml);
        assert_eq!(session.config().status_timeout(), None);

        let err = session
            .receive_with_timeout(Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out() {
        let (session, _peer) = mock_session(WireFormat::Xml);
        let err = session.request(&Message::dictionary()).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }
}
