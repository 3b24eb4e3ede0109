//! Installation proxy: browse, look up, install and remove applications.

use tether_core::{ClientOptions, Dictionary, Message};
use tether_protocol::{StatusError, StatusMessage};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::device::{Connector, DeviceRef, Lockdown, ServiceDescriptor};
use crate::error::{ClientError, ClientResult};
use crate::operation::{Operation, OperationHandle};
use crate::session::Session;

/// Lockdown name of the installation proxy service.
pub const SERVICE_NAME: &str = "com.apple.mobile.installation_proxy";

const KEY_COMMAND: &str = "Command";
const KEY_CLIENT_OPTIONS: &str = "ClientOptions";
const KEY_PACKAGE_PATH: &str = "PackagePath";
const KEY_APPLICATION_IDENTIFIER: &str = "ApplicationIdentifier";
const KEY_CAPABILITIES: &str = "Capabilities";
const KEY_LOOKUP_RESULT: &str = "LookupResult";

const ATTR_BUNDLE_IDENTIFIER: &str = "CFBundleIdentifier";
const ATTR_BUNDLE_EXECUTABLE: &str = "CFBundleExecutable";
const ATTR_PATH: &str = "Path";

/// Client for the installation proxy service.
#[derive(Debug)]
pub struct InstallationProxy {
    session: Session,
}

impl InstallationProxy {
    /// Connects to a running installation proxy.
    pub async fn open(
        connector: &dyn Connector,
        device: &DeviceRef,
        descriptor: &ServiceDescriptor,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        let session = Session::open(connector, device, descriptor, SERVICE_NAME, config).await?;
        Ok(Self { session })
    }

    /// Starts the service through lockdown and connects to it.
    pub async fn start_service(
        lockdown: &dyn Lockdown,
        connector: &dyn Connector,
        device: &DeviceRef,
        label: Option<&str>,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        let session =
            Session::start_and_open(lockdown, connector, device, SERVICE_NAME, label, config).await?;
        Ok(Self { session })
    }

    /// Uses an already-open session.
    pub fn attach(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn close(&mut self) -> ClientResult<()> {
        self.session.close().await
    }

    /// Lists installed applications, following all result pages.
    pub async fn browse(&self, options: Option<&ClientOptions>) -> ClientResult<Vec<Message>> {
        let outcome = self.start("Browse", options, []).await?.wait().await?;
        let apps = outcome.items.unwrap_or_default();
        info!(count = apps.len(), pages = outcome.statuses, "browse complete");
        Ok(apps)
    }

    /// Lists installed applications, delivering each page to `callback`.
    pub async fn browse_with_callback<U, F>(
        &self,
        options: Option<&ClientOptions>,
        user_data: U,
        callback: F,
    ) -> ClientResult<OperationHandle>
    where
        U: Send + 'static,
        F: FnMut(Message, &U) + Send + 'static,
    {
        self.start("Browse", options, [])
            .await?
            .spawn_with_callback(user_data, callback)
    }

    /// Installs the package at `package_path`.
    ///
    /// The path is inside the device's staging area. With `PackageType =
    /// Developer` it names an `.app` directory instead of a package.
    pub async fn install(
        &self,
        package_path: &str,
        options: Option<&ClientOptions>,
    ) -> ClientResult<Operation> {
        let path = required("package path", package_path)?;
        self.start("Install", options, [(KEY_PACKAGE_PATH, path)]).await
    }

    /// Like [`install`](Self::install), for an application that is
    /// already installed.
    pub async fn upgrade(
        &self,
        package_path: &str,
        options: Option<&ClientOptions>,
    ) -> ClientResult<Operation> {
        let path = required("package path", package_path)?;
        self.start("Upgrade", options, [(KEY_PACKAGE_PATH, path)]).await
    }

    pub async fn uninstall(
        &self,
        app_id: &str,
        options: Option<&ClientOptions>,
    ) -> ClientResult<Operation> {
        let app_id = required("application identifier", app_id)?;
        self.start("Uninstall", options, [(KEY_APPLICATION_IDENTIFIER, app_id)])
            .await
    }

    /// Archives an installed application on the device.
    pub async fn archive(
        &self,
        app_id: &str,
        options: Option<&ClientOptions>,
    ) -> ClientResult<Operation> {
        let app_id = required("application identifier", app_id)?;
        self.start("Archive", options, [(KEY_APPLICATION_IDENTIFIER, app_id)])
            .await
    }

    /// Restores a previously archived application.
    pub async fn restore(
        &self,
        app_id: &str,
        options: Option<&ClientOptions>,
    ) -> ClientResult<Operation> {
        let app_id = required("application identifier", app_id)?;
        self.start("Restore", options, [(KEY_APPLICATION_IDENTIFIER, app_id)])
            .await
    }

    pub async fn remove_archive(
        &self,
        app_id: &str,
        options: Option<&ClientOptions>,
    ) -> ClientResult<Operation> {
        let app_id = required("application identifier", app_id)?;
        self.start("RemoveArchive", options, [(KEY_APPLICATION_IDENTIFIER, app_id)])
            .await
    }

    /// Looks up applications by bundle identifier.
    ///
    /// An empty identifier list looks up every application. Returns the
    /// dictionary keyed by bundle identifier.
    pub async fn lookup<S, I>(
        &self,
        app_ids: I,
        options: Option<&ClientOptions>,
    ) -> ClientResult<Message>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let app_ids: Vec<String> = app_ids.into_iter().map(Into::into).collect();
        let options = if app_ids.is_empty() {
            options.cloned()
        } else {
            let builder = options.map_or_else(ClientOptions::builder, ClientOptions::to_builder);
            Some(builder.bundle_ids(app_ids).build())
        };

        let reply = self.query(request("Lookup", options.as_ref(), [])).await?;
        lookup_result(reply)
    }

    /// Lists archived applications.
    pub async fn lookup_archives(&self, options: Option<&ClientOptions>) -> ClientResult<Message> {
        let reply = self.query(request("LookupArchives", options, [])).await?;
        lookup_result(reply)
    }

    /// Asks whether the device satisfies `capabilities`.
    pub async fn check_capabilities_match<S: AsRef<str>>(
        &self,
        capabilities: &[S],
        options: Option<&ClientOptions>,
    ) -> ClientResult<Message> {
        if capabilities.is_empty() {
            return Err(ClientError::invalid_argument("no capabilities to check"));
        }
        let capabilities = Message::string_array(capabilities.iter().map(|c| c.as_ref().to_string()));

        let reply = self
            .query(request(
                "CheckCapabilitiesMatch",
                options,
                [(KEY_CAPABILITIES, capabilities)],
            ))
            .await?;
        lookup_result(reply)
    }

    /// Returns the full path of an installed application's executable.
    pub async fn path_for_bundle_identifier(&self, bundle_id: &str) -> ClientResult<String> {
        if bundle_id.is_empty() {
            return Err(ClientError::invalid_argument("bundle identifier is empty"));
        }
        let options = ClientOptions::builder()
            .set_return_attributes([ATTR_BUNDLE_IDENTIFIER, ATTR_BUNDLE_EXECUTABLE, ATTR_PATH])
            .build();

        let apps = self.lookup([bundle_id], Some(&options)).await?;
        let app = apps.get(bundle_id);
        let path = app.and_then(|a| a.get_str(ATTR_PATH));
        let executable = app.and_then(|a| a.get_str(ATTR_BUNDLE_EXECUTABLE));

        match (path, executable) {
            (Some(path), Some(executable)) => Ok(format!("{path}/{executable}")),
            _ => Err(ClientError::RemoteOperationFailed(StatusError {
                name: Some("ApplicationNotFound".to_string()),
                description: Some(format!("{bundle_id} is not installed")),
                code: None,
            })),
        }
    }

    async fn start<const N: usize>(
        &self,
        command: &str,
        options: Option<&ClientOptions>,
        arguments: [(&str, Message); N],
    ) -> ClientResult<Operation> {
        Operation::start(&self.session, Message::Dictionary(request(command, options, arguments)))
            .await
    }

    /// Sends a request that is answered by exactly one reply.
    async fn query(&self, request: Dictionary) -> ClientResult<Message> {
        let command = request
            .get(KEY_COMMAND)
            .and_then(Message::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(command = %command, "query");

        let reply = StatusMessage::new(self.session.request(&Message::Dictionary(request)).await?)?;
        if let Some(error) = reply.error() {
            return Err(ClientError::from_status(error));
        }
        Ok(reply.into_message())
    }
}

fn required(what: &str, value: &str) -> ClientResult<Message> {
    if value.is_empty() {
        return Err(ClientError::invalid_argument(format!("{what} is empty")));
    }
    Ok(Message::from(value))
}

fn request<const N: usize>(
    command: &str,
    options: Option<&ClientOptions>,
    arguments: [(&str, Message); N],
) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.insert(KEY_COMMAND.to_string(), Message::from(command));
    if let Some(options) = options {
        dict.insert(KEY_CLIENT_OPTIONS.to_string(), options.to_message());
    }
    for (key, value) in arguments {
        dict.insert(key.to_string(), value);
    }
    dict
}

fn lookup_result(reply: Message) -> ClientResult<Message> {
    let received = reply.kind().to_string();
    reply
        .into_dictionary()
        .and_then(|mut dict| dict.shift_remove(KEY_LOOKUP_RESULT))
        .filter(|result| result.as_dictionary().is_some())
        .ok_or_else(|| ClientError::unexpected_reply(KEY_LOOKUP_RESULT, received))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tether_core::ApplicationType;
    use tether_protocol::{MessageStream, WireFormat, current_list};
    use tokio::io::DuplexStream;

    use super::*;
    use crate::error::ErrorKind;
    use crate::operation::OperationState;
    use crate::session::test_support::mock_session;

    fn proxy(format: WireFormat) -> (InstallationProxy, MessageStream<DuplexStream>) {
        let (session, peer) = mock_session(format);
        (InstallationProxy::attach(session), peer)
    }

    fn app(id: &str) -> Message {
        Message::from_pairs([
            (ATTR_BUNDLE_IDENTIFIER, Message::from(id)),
            (ATTR_BUNDLE_EXECUTABLE, Message::from("Runner")),
            (ATTR_PATH, Message::from(format!("/private/var/containers/{id}.app"))),
        ])
    }

    fn lookup_reply(apps: &[&str]) -> Message {
        let result: Dictionary = apps.iter().map(|id| (id.to_string(), app(id))).collect();
        Message::from_pairs([
            ("Status", Message::from("Complete")),
            (KEY_LOOKUP_RESULT, Message::Dictionary(result)),
        ])
    }

    #[test]
    fn lookup_request_wire_shape() {
        let options = ClientOptions::builder()
            .application_type(ApplicationType::User)
            .bundle_ids(["com.example.app"])
            .build();
        let request = Message::Dictionary(request("Lookup", Some(&options), []));

        insta::assert_json_snapshot!(request, @r###"
        {
          "dictionary": {
            "Command": {
              "string": "Lookup"
            },
            "ClientOptions": {
              "dictionary": {
                "ApplicationType": {
                  "string": "User"
                },
                "BundleIDs": {
                  "array": [
                    {
                      "string": "com.example.app"
                    }
                  ]
                }
              }
            }
          }
        }
        "###);
    }

    #[tokio::test]
    async fn browse_merges_pages() {
        let (proxy, mut peer) = proxy(WireFormat::Xml);

        let device = tokio::spawn(async move {
            let request = peer.receive().await.unwrap();
            assert_eq!(request.get_str("Command"), Some("Browse"));
            for ids in [&["a", "b"][..], &["c"][..]] {
                let page = Message::from_pairs([
                    ("Status", Message::from("BrowsingApplications")),
                    ("CurrentList", Message::Array(ids.iter().map(|id| app(id)).collect())),
                ]);
                peer.send(&page).await.unwrap();
            }
            peer.send(&Message::from_pairs([("Status", "Complete")]))
                .await
                .unwrap();
            peer
        });

        let apps = proxy.browse(None).await.unwrap();
        let _peer = device.await.unwrap();
        let ids: Vec<_> = apps
            .iter()
            .filter_map(|a| a.get_str(ATTR_BUNDLE_IDENTIFIER))
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn browse_with_callback_sees_each_page() {
        let (proxy, mut peer) = proxy(WireFormat::Xml);
        let pages = Arc::new(Mutex::new(Vec::new()));

        let handle = proxy
            .browse_with_callback(None, Arc::clone(&pages), |status, pages: &Arc<Mutex<Vec<u64>>>| {
                pages.lock().unwrap().push(current_list(&status).current_amount);
            })
            .await
            .unwrap();

        peer.receive().await.unwrap();
        peer.send(&Message::from_pairs([
            ("CurrentAmount", Message::from(2)),
            ("CurrentList", Message::Array(vec![app("a"), app("b")])),
        ]))
        .await
        .unwrap();
        peer.send(&Message::from_pairs([("Status", "Complete")]))
            .await
            .unwrap();

        assert_eq!(handle.join().await, OperationState::Completed);
        assert_eq!(*pages.lock().unwrap(), vec![2, 0]);
    }

    #[tokio::test]
    async fn install_sends_package_path_and_options() {
        let (proxy, mut peer) = proxy(WireFormat::Binary);
        let options = ClientOptions::builder()
            .package_type("Developer")
            .unwrap()
            .build();

        let operation = proxy
            .install("PublicStaging/Runner.app", Some(&options))
            .await
            .unwrap();

        let request = peer.receive().await.unwrap();
        assert_eq!(request.get_str("Command"), Some("Install"));
        assert_eq!(request.get_str(KEY_PACKAGE_PATH), Some("PublicStaging/Runner.app"));
        assert_eq!(
            request.get(KEY_CLIENT_OPTIONS).and_then(|o| o.get_str("PackageType")),
            Some("Developer")
        );

        peer.send(&Message::from_pairs([("Status", "Complete")]))
            .await
            .unwrap();
        assert!(operation.wait().await.unwrap().status.is_complete());
    }

    #[tokio::test]
    async fn removal_commands_name_the_application() {
        let (proxy, mut peer) = proxy(WireFormat::Xml);

        for command in ["Uninstall", "Archive", "Restore", "RemoveArchive"] {
            let operation = match command {
                "Uninstall" => proxy.uninstall("com.example.app", None).await,
                "Archive" => proxy.archive("com.example.app", None).await,
                "Restore" => proxy.restore("com.example.app", None).await,
                _ => proxy.remove_archive("com.example.app", None).await,
            }
            .unwrap();

            let request = peer.receive().await.unwrap();
            assert_eq!(request.get_str("Command"), Some(command));
            assert_eq!(request.get_str(KEY_APPLICATION_IDENTIFIER), Some("com.example.app"));
            assert_eq!(request.get(KEY_CLIENT_OPTIONS), None);

            peer.send(&Message::from_pairs([("Status", "Complete")]))
                .await
                .unwrap();
            operation.wait().await.unwrap();
        }
    }

    #[tokio::test]
    async fn empty_arguments_are_rejected_before_io() {
        let (proxy, _peer) = proxy(WireFormat::Xml);

        let err = proxy.install("", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = proxy.uninstall("", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = proxy
            .check_capabilities_match::<&str>(&[], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn lookup_by_identifier() {
        let (proxy, mut peer) = proxy(WireFormat::Xml);

        let device = tokio::spawn(async move {
            let request = peer.receive().await.unwrap();
            assert_eq!(request.get_str("Command"), Some("Lookup"));
            let ids = request
                .get(KEY_CLIENT_OPTIONS)
                .and_then(|o| o.get("BundleIDs"))
                .cloned();
            assert_eq!(ids, Some(Message::string_array(["com.example.app"])));
            peer.send(&lookup_reply(&["com.example.app"])).await.unwrap();
            peer
        });

        let result = proxy.lookup(["com.example.app"], None).await.unwrap();
        device.await.unwrap();
        assert!(result.get("com.example.app").is_some());
    }

    #[tokio::test]
    async fn lookup_all_sends_no_bundle_ids() {
        let (proxy, mut peer) = proxy(WireFormat::Xml);

        let device = tokio::spawn(async move {
            let request = peer.receive().await.unwrap();
            assert_eq!(request.get(KEY_CLIENT_OPTIONS), None);
            peer.send(&lookup_reply(&["a", "b"])).await.unwrap();
            peer
        });

        let result = proxy.lookup(Vec::<String>::new(), None).await.unwrap();
        device.await.unwrap();
        assert_eq!(result.as_dictionary().map(|d| d.len()), Some(2));
    }

    #[tokio::test]
    async fn lookup_reply_with_error_node_fails() {
        let (proxy, mut peer) = proxy(WireFormat::Xml);

        let device = tokio::spawn(async move {
            peer.receive().await.unwrap();
            peer.send(&Message::from_pairs([
                ("Error", Message::from("APIInternalError")),
                ("ErrorDescription", Message::from("lookup failed")),
            ]))
            .await
            .unwrap();
            peer
        });

        let err = proxy.lookup_archives(None).await.unwrap_err();
        device.await.unwrap();
        assert_eq!(err.kind(), ErrorKind::RemoteOperationFailed);
    }

    #[tokio::test]
    async fn reply_without_lookup_result_is_unexpected() {
        let (proxy, mut peer) = proxy(WireFormat::Xml);

        let device = tokio::spawn(async move {
            peer.receive().await.unwrap();
            peer.send(&Message::from_pairs([("Status", "Complete")]))
                .await
                .unwrap();
            peer
        });

        let err = proxy.lookup_archives(None).await.unwrap_err();
        device.await.unwrap();
        assert_eq!(err.kind(), ErrorKind::UnexpectedReply);
    }

    #[tokio::test]
    async fn capabilities_are_sent_as_strings() {
        let (proxy, mut peer) = proxy(WireFormat::Xml);

        let device = tokio::spawn(async move {
            let request = peer.receive().await.unwrap();
            assert_eq!(request.get_str("Command"), Some("CheckCapabilitiesMatch"));
            assert_eq!(
                request.get(KEY_CAPABILITIES),
                Some(&Message::string_array(["arm64", "metal"]))
            );
            peer.send(&Message::from_pairs([(KEY_LOOKUP_RESULT, Message::dictionary())]))
                .await
                .unwrap();
            peer
        });

        proxy
            .check_capabilities_match(&["arm64", "metal"], None)
            .await
            .unwrap();
        device.await.unwrap();
    }

    #[tokio::test]
    async fn path_for_bundle_identifier_joins_path_and_executable() {
        let (proxy, mut peer) = proxy(WireFormat::Xml);

        let device = tokio::spawn(async move {
            let request = peer.receive().await.unwrap();
            let attributes = request
                .get(KEY_CLIENT_OPTIONS)
                .and_then(|o| o.get("ReturnAttributes"))
                .cloned();
            assert_eq!(
                attributes,
                Some(Message::string_array([
                    ATTR_BUNDLE_IDENTIFIER,
                    ATTR_BUNDLE_EXECUTABLE,
                    ATTR_PATH
                ]))
            );
            peer.send(&lookup_reply(&["com.example.app"])).await.unwrap();
            peer
        });

        let path = proxy
            .path_for_bundle_identifier("com.example.app")
            .await
            .unwrap();
        device.await.unwrap();
        assert_eq!(path, "/private/var/containers/com.example.app.app/Runner");
    }

    #[tokio::test]
    async fn path_for_missing_application() {
        let (proxy, mut peer) = proxy(WireFormat::Xml);

        let device = tokio::spawn(async move {
            peer.receive().await.unwrap();
            peer.send(&lookup_reply(&[])).await.unwrap();
            peer
        });

        let err = proxy
            .path_for_bundle_identifier("com.example.missing")
            .await
            .unwrap_err();
        device.await.unwrap();
        assert_eq!(err.kind(), ErrorKind::RemoteOperationFailed);
        assert_eq!(
            err.to_status_error().name.as_deref(),
            Some("ApplicationNotFound")
        );
    }

    #[tokio::test]
    async fn abandoned_install_statuses_never_answer_a_query() {
        let (proxy, mut peer) = proxy(WireFormat::Xml);

        let operation = proxy.install("PublicStaging/app.ipa", None).await.unwrap();
        peer.receive().await.unwrap();
        peer.send(&Message::from_pairs([
            ("Status", Message::from("CopyingApplication")),
            ("PercentComplete", Message::from(20)),
        ]))
        .await
        .unwrap();
        drop(operation);

        assert!(proxy.session().is_desynchronized());
        let err = proxy.lookup_archives(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(err.to_string().contains("desynchronized"));
    }

    #[tokio::test]
    async fn closed_proxy_is_invalid_state() {
        let (mut proxy, _peer) = proxy(WireFormat::Xml);
        proxy.close().await.unwrap();
        proxy.close().await.unwrap();

        let err = proxy.lookup_archives(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
