//! Mobile backup: the manually driven backup and restore exchange.
//!
//! Every payload travels inside a DeviceLink process message. The device
//! opens the link with a version exchange, which [`MobileBackup`] answers
//! before handing the session to the caller.
//!
//! Apart from the handshake nothing here loops: each call sends or waits
//! for one message, and the caller drives the exchange.

use std::cmp::Ordering;
use std::sync::LazyLock;

use bitflags::bitflags;
use regex::Regex;
use tether_core::{Dictionary, Message};
use tether_protocol::{DL_DEVICE_READY, DL_PROCESS_MESSAGE, DL_VERSION_EXCHANGE, DeviceLinkMessage};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::device::{Connector, DeviceRef, Lockdown, ServiceDescriptor};
use crate::error::{ClientError, ClientResult};
use crate::session::Session;

/// Lockdown name of the mobile backup service.
pub const SERVICE_NAME: &str = "com.apple.mobilebackup";

/// DeviceLink version this client speaks.
pub const DEVICE_LINK_VERSION_MAJOR: u64 = 100;
pub const DEVICE_LINK_VERSION_MINOR: u64 = 0;

const KEY_MESSAGE_TYPE: &str = "BackupMessageTypeKey";
const KEY_MANIFEST: &str = "BackupManifestKey";
const KEY_BASE_PATH: &str = "BackupComputerBasePath";
const KEY_PROTOCOL_VERSION: &str = "BackupProtocolVersion";
const KEY_ERROR_REASON: &str = "BackupErrorReasonKey";
const KEY_NOTIFY_SPRINGBOARD: &str = "BackupNotifySpringBoard";
const KEY_PRESERVE_SETTINGS: &str = "BackupPreserveSettings";
const KEY_PRESERVE_CAMERA_ROLL: &str = "BackupPreserveCameraRoll";

const MSG_BACKUP_REQUEST: &str = "BackupMessageBackupRequest";
const MSG_BACKUP_REPLY_OK: &str = "BackupMessageBackupReplyOK";
const MSG_BACKUP_FILE_RECEIVED: &str = "kBackupMessageBackupFileReceived";
const MSG_RESTORE_REQUEST: &str = "kBackupMessageRestoreRequest";
const MSG_RESTORE_REPLY_OK: &str = "BackupMessageRestoreReplyOK";
const MSG_RESTORE_FILE_RECEIVED: &str = "BackupMessageRestoreFileReceived";
const MSG_RESTORE_APPLICATION_RECEIVED: &str = "BackupMessageRestoreApplicationReceived";
const MSG_RESTORE_COMPLETE: &str = "BackupMessageRestoreComplete";
const MSG_ERROR: &str = "BackupMessageError";

static VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(\.\d+)*$").expect("Invalid version regex"));

bitflags! {
    /// Options for a restore request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RestoreFlags: u32 {
        /// Show the restore progress on the device.
        const NOTIFY_SPRINGBOARD   = 1 << 0;
        const PRESERVE_SETTINGS    = 1 << 1;
        const PRESERVE_CAMERA_ROLL = 1 << 2;
    }
}

/// Client for the mobile backup service.
#[derive(Debug)]
pub struct MobileBackup {
    session: Session,
    /// Version of the backup request awaiting its reply.
    pending_version: Option<String>,
}

impl MobileBackup {
    /// Connects to a running backup service and completes the handshake.
    pub async fn open(
        connector: &dyn Connector,
        device: &DeviceRef,
        descriptor: &ServiceDescriptor,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        let session = Session::open(connector, device, descriptor, SERVICE_NAME, config).await?;
        Self::attach(session).await
    }

    /// Starts the service through lockdown, connects and completes the
    /// handshake.
    pub async fn start_service(
        lockdown: &dyn Lockdown,
        connector: &dyn Connector,
        device: &DeviceRef,
        label: Option<&str>,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        let session =
            Session::start_and_open(lockdown, connector, device, SERVICE_NAME, label, config).await?;
        Self::attach(session).await
    }

    /// Runs the DeviceLink handshake on an open session.
    pub async fn attach(mut session: Session) -> ClientResult<Self> {
        if let Err(e) = handshake(&session).await {
            session.close().await?;
            return Err(e);
        }
        Ok(Self {
            session,
            pending_version: None,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Sends a disconnect to the device, then closes the session.
    pub async fn close(&mut self) -> ClientResult<()> {
        if self.session.is_open() {
            let disconnect = DeviceLinkMessage::Disconnect(String::new()).to_message();
            if let Err(e) = self.session.send(&disconnect).await {
                debug!(error = %e, "disconnect not delivered");
            }
        }
        self.session.close().await
    }

    /// Asks the device to start a backup.
    ///
    /// Sends exactly one message and returns without waiting; the device's
    /// reply is checked by [`receive`](Self::receive). Without
    /// `proto_version` the configured `backup_protocol_version` is sent.
    pub async fn request_backup(
        &mut self,
        manifest: Option<&Message>,
        base_path: &str,
        proto_version: Option<&str>,
    ) -> ClientResult<()> {
        if let Some(manifest) = manifest {
            if manifest.as_dictionary().is_none() {
                return Err(ClientError::invalid_argument(format!(
                    "backup manifest must be a dictionary, got {}",
                    manifest.kind()
                )));
            }
        }
        if base_path.is_empty() {
            return Err(ClientError::invalid_argument("backup base path is empty"));
        }
        let proto_version = self.protocol_version(proto_version);
        validate_version(&proto_version)?;

        let payload = backup_message(
            MSG_BACKUP_REQUEST,
            [
                (KEY_MANIFEST, manifest.cloned().unwrap_or(Message::Null)),
                (KEY_BASE_PATH, Message::from(base_path)),
                (KEY_PROTOCOL_VERSION, Message::from(proto_version.as_str())),
            ],
        );
        self.send_payload(payload).await?;

        info!(version = %proto_version, base_path = %base_path, "backup requested");
        self.pending_version = Some(proto_version);
        Ok(())
    }

    fn protocol_version(&self, requested: Option<&str>) -> String {
        requested
            .unwrap_or(self.session.config().backup_protocol_version.as_str())
            .to_string()
    }

    /// Sends a DeviceLink process message carrying `payload`.
    pub async fn send(&self, payload: &Message) -> ClientResult<()> {
        let dict = payload.as_dictionary().ok_or_else(|| {
            ClientError::invalid_argument(format!(
                "backup payload must be a dictionary, got {}",
                payload.kind()
            ))
        })?;
        self.send_payload(dict.clone()).await
    }

    /// Receives the next process message payload.
    ///
    /// A backup reply that reports a newer protocol than was requested
    /// fails with [`ClientError::ProtocolVersionMismatch`].
    pub async fn receive(&mut self) -> ClientResult<Message> {
        let payload = self.receive_payload().await?;
        if message_type(&payload) == Some(MSG_BACKUP_REPLY_OK) {
            if let Some(requested) = self.pending_version.take() {
                check_version(&requested, &payload)?;
            }
        }
        Ok(payload)
    }

    /// Acknowledges a file received from the device during backup.
    pub async fn send_backup_file_received(&self) -> ClientResult<()> {
        self.send_payload(backup_message(MSG_BACKUP_FILE_RECEIVED, []))
            .await
    }

    /// Asks the device to restore from `manifest` and waits for its
    /// acceptance.
    ///
    /// Returns the device's reply. Without `proto_version` the configured
    /// `backup_protocol_version` is sent.
    pub async fn request_restore(
        &self,
        manifest: &Message,
        flags: RestoreFlags,
        proto_version: Option<&str>,
    ) -> ClientResult<Message> {
        if manifest.as_dictionary().is_none() {
            return Err(ClientError::invalid_argument(format!(
                "restore manifest must be a dictionary, got {}",
                manifest.kind()
            )));
        }
        let proto_version = self.protocol_version(proto_version);
        validate_version(&proto_version)?;

        let payload = backup_message(
            MSG_RESTORE_REQUEST,
            [
                (KEY_MANIFEST, manifest.clone()),
                (KEY_PROTOCOL_VERSION, Message::from(proto_version.as_str())),
                (
                    KEY_NOTIFY_SPRINGBOARD,
                    Message::from(flags.contains(RestoreFlags::NOTIFY_SPRINGBOARD)),
                ),
                (
                    KEY_PRESERVE_SETTINGS,
                    Message::from(flags.contains(RestoreFlags::PRESERVE_SETTINGS)),
                ),
                (
                    KEY_PRESERVE_CAMERA_ROLL,
                    Message::from(flags.contains(RestoreFlags::PRESERVE_CAMERA_ROLL)),
                ),
            ],
        );
        self.send_payload(payload).await?;
        info!(version = %proto_version, flags = ?flags, "restore requested");

        let reply = self.expect_message(MSG_RESTORE_REPLY_OK).await?;
        check_version(&proto_version, &reply)?;
        match reply.get(KEY_MANIFEST) {
            Some(echoed) if echoed != manifest => Err(ClientError::unexpected_reply(
                "restore reply for the requested manifest",
                "restore reply for a different manifest",
            )),
            _ => Ok(reply),
        }
    }

    /// Waits for the device to confirm a restored file.
    pub async fn receive_restore_file_received(&self) -> ClientResult<Message> {
        self.expect_message(MSG_RESTORE_FILE_RECEIVED).await
    }

    /// Waits for the device to confirm a restored application.
    pub async fn receive_restore_application_received(&self) -> ClientResult<Message> {
        self.expect_message(MSG_RESTORE_APPLICATION_RECEIVED).await
    }

    /// Tells the device the restore is complete. Does not wait for the
    /// device to disconnect.
    pub async fn send_restore_complete(&self) -> ClientResult<()> {
        self.send_payload(backup_message(MSG_RESTORE_COMPLETE, []))
            .await?;
        info!("restore complete");
        Ok(())
    }

    /// Reports an error to the device. Failures to deliver are only logged.
    pub async fn send_error(&self, reason: &str) {
        let payload = backup_message(MSG_ERROR, [(KEY_ERROR_REASON, Message::from(reason))]);
        if let Err(e) = self.send_payload(payload).await {
            warn!(reason = %reason, error = %e, "failed to send backup error");
        }
    }

    async fn send_payload(&self, payload: Dictionary) -> ClientResult<()> {
        let kind = payload
            .get(KEY_MESSAGE_TYPE)
            .and_then(Message::as_str)
            .unwrap_or_default()
            .to_string();
        self.session
            .send(&DeviceLinkMessage::Process(payload).to_message())
            .await?;
        debug!(message_type = %kind, "backup message sent");
        Ok(())
    }

    async fn receive_payload(&self) -> ClientResult<Message> {
        let message = self.session.receive().await?;
        match DeviceLinkMessage::parse(&message)? {
            DeviceLinkMessage::Process(payload) => {
                let payload = Message::Dictionary(payload);
                debug!(message_type = message_type(&payload).unwrap_or_default(), "backup message received");
                Ok(payload)
            }
            DeviceLinkMessage::Disconnect(reason) => {
                info!(reason = %reason, "device disconnected");
                Err(ClientError::ConnectionClosed { locally: false })
            }
            other => Err(ClientError::unexpected_reply(DL_PROCESS_MESSAGE, other.name())),
        }
    }

    /// Receives one payload and requires it to be of type `expected`.
    async fn expect_message(&self, expected: &str) -> ClientResult<Message> {
        let payload = match self.receive_payload().await {
            Ok(payload) => payload,
            Err(ClientError::ConnectionClosed { locally: false }) => {
                return Err(ClientError::unexpected_reply(expected, "disconnect"));
            }
            Err(e) => return Err(e),
        };
        let received = message_type(&payload).unwrap_or("untyped message");
        if received != expected {
            return Err(ClientError::unexpected_reply(expected, received));
        }
        Ok(payload)
    }
}

/// Version exchange. Each step is a single reply, bounded by the I/O timeout.
async fn handshake(session: &Session) -> ClientResult<()> {
    let timeout = Some(session.config().io_timeout());
    let (major, minor) = match DeviceLinkMessage::parse(&session.receive_with_timeout(timeout).await?)? {
        DeviceLinkMessage::VersionExchange { major, minor } => (major, minor),
        other => return Err(ClientError::unexpected_reply(DL_VERSION_EXCHANGE, other.name())),
    };
    if major > DEVICE_LINK_VERSION_MAJOR {
        return Err(ClientError::ProtocolVersionMismatch {
            local: format!("{DEVICE_LINK_VERSION_MAJOR}.{DEVICE_LINK_VERSION_MINOR}"),
            remote: format!("{major}.{minor}"),
        });
    }
    debug!(major, minor, "device link version exchange");

    session
        .send(
            &DeviceLinkMessage::VersionsOk {
                major: DEVICE_LINK_VERSION_MAJOR,
            }
            .to_message(),
        )
        .await?;

    match DeviceLinkMessage::parse(&session.receive_with_timeout(timeout).await?)? {
        DeviceLinkMessage::DeviceReady => {
            info!(service = %session.service(), "device link ready");
            Ok(())
        }
        other => Err(ClientError::unexpected_reply(DL_DEVICE_READY, other.name())),
    }
}

fn backup_message<const N: usize>(kind: &str, fields: [(&str, Message); N]) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.insert(KEY_MESSAGE_TYPE.to_string(), Message::from(kind));
    for (key, value) in fields {
        dict.insert(key.to_string(), value);
    }
    dict
}

fn message_type(payload: &Message) -> Option<&str> {
    payload.get_str(KEY_MESSAGE_TYPE)
}

fn validate_version(version: &str) -> ClientResult<()> {
    if !VERSION_REGEX.is_match(version) {
        return Err(ClientError::invalid_argument(format!(
            "invalid protocol version {version:?}"
        )));
    }
    Ok(())
}

fn version_parts(version: &str) -> Option<Vec<u64>> {
    if !VERSION_REGEX.is_match(version) {
        return None;
    }
    version.split('.').map(|part| part.parse().ok()).collect()
}

fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let (mut a, mut b) = (version_parts(a)?, version_parts(b)?);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    Some(a.cmp(&b))
}

/// Fails if `reply` reports a protocol version newer than `requested`.
fn check_version(requested: &str, reply: &Message) -> ClientResult<()> {
    let remote = match reply.get(KEY_PROTOCOL_VERSION) {
        Some(Message::String(v)) => v.clone(),
        Some(Message::Real(v)) => v.to_string(),
        Some(Message::Integer(v)) => v.to_string(),
        _ => return Ok(()),
    };
    if compare_versions(&remote, requested) == Some(Ordering::Greater) {
        warn!(requested = %requested, remote = %remote, "device speaks a newer backup protocol");
        return Err(ClientError::ProtocolVersionMismatch {
            local: requested.to_string(),
            remote,
        });
    }
    Ok(())
}
