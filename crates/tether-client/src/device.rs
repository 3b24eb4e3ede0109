//! Device-side collaborators: how a service gets started and reached.
//!
//! Discovering devices and negotiating with lockdown happen elsewhere. This
//! module only names the two seams a session needs: something that starts a
//! service and reports where it listens ([`Lockdown`]), and something that
//! opens a byte stream to that place ([`Connector`]).

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Boxed future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A handle to one attached device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceRef {
    udid: String,
}

impl DeviceRef {
    /// Creates a device reference; the identifier must not be empty.
    pub fn new(udid: impl Into<String>) -> ClientResult<Self> {
        let udid = udid.into();
        if udid.trim().is_empty() {
            return Err(ClientError::invalid_argument("device identifier is empty"));
        }
        Ok(Self { udid })
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }
}

/// Where a started service listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub port: u16,
    pub ssl_enabled: bool,
    /// Identifier the service was started under, if known.
    pub identifier: Option<String>,
}

impl ServiceDescriptor {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ssl_enabled: false,
            identifier: None,
        }
    }

    #[must_use]
    pub fn with_ssl(mut self, enabled: bool) -> Self {
        self.ssl_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        if self.port == 0 {
            return Err(ClientError::invalid_argument("service descriptor has no port"));
        }
        Ok(())
    }
}

/// A byte stream to a device service.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedConnection = Box<dyn Connection>;

/// Opens byte streams to started services.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        device: &'a DeviceRef,
        service: &'a ServiceDescriptor,
    ) -> BoxFuture<'a, io::Result<BoxedConnection>>;
}

/// Starts services on a device.
pub trait Lockdown: Send + Sync {
    /// Starts `service_name` and returns where it listens.
    ///
    /// `label` identifies the client to the device; `None` sends no label.
    fn start_service<'a>(
        &'a self,
        device: &'a DeviceRef,
        service_name: &'a str,
        label: Option<&'a str>,
    ) -> BoxFuture<'a, ClientResult<ServiceDescriptor>>;
}

/// Connects over plain TCP, for devices reachable through a port forwarder.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new("127.0.0.1")
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        device: &'a DeviceRef,
        service: &'a ServiceDescriptor,
    ) -> BoxFuture<'a, io::Result<BoxedConnection>> {
        Box::pin(async move {
            if service.ssl_enabled {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "TLS service connections are not supported by the TCP connector",
                ));
            }
            debug!(device = %device.udid(), host = %self.host, port = service.port, "connecting");
            let stream = TcpStream::connect((self.host.as_str(), service.port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedConnection)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_udid_is_rejected() {
        assert!(matches!(
            DeviceRef::new("  "),
            Err(ClientError::InvalidArgument(_))
        ));
        assert_eq!(DeviceRef::new("00008030-ABC").unwrap().udid(), "00008030-ABC");
    }

    #[test]
    fn descriptor_without_port_is_invalid() {
        assert!(ServiceDescriptor::new(0).validate().is_err());
        assert!(ServiceDescriptor::new(62078).validate().is_ok());
    }

    #[tokio::test]
    async fn tcp_connector_refuses_ssl() {
        let device = DeviceRef::new("device").unwrap();
        let descriptor = ServiceDescriptor::new(1234).with_ssl(true);
        let err = TcpConnector::default()
            .connect(&device, &descriptor)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn tcp_connector_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let device = DeviceRef::new("device").unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let connection = TcpConnector::default()
            .connect(&device, &ServiceDescriptor::new(port))
            .await;
        assert!(connection.is_ok());
        accept.await.unwrap().unwrap();
    }
}
