//! Long-running operations that report progress as a stream of statuses.
//!
//! An [`Operation`] owns its session's connection from the moment the
//! request is sent until a terminal status arrives. It can be consumed in
//! three ways:
//!
//! - pulled one status at a time with [`Operation::next_status`],
//! - awaited to completion with [`Operation::wait`],
//! - handed to a background task with [`Operation::spawn_with_callback`].

use std::time::Duration;

use tether_core::Message;
use tether_protocol::{StatusMessage, command_get_name, error_status};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::{ClientError, ClientResult};
use crate::session::{Exchange, Session};

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Starting,
    Running,
    Completed,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// How an operation's statuses reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    /// The caller pulls statuses or awaits the outcome.
    Blocking,
    /// A background task pushes every status into a callback.
    Callback,
}

/// Result of an operation awaited to completion.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    /// The terminal status.
    pub status: StatusMessage,
    /// `CurrentList` pages concatenated in arrival order, if any status
    /// carried one.
    pub items: Option<Vec<Message>>,
    /// Number of statuses received, terminal one included.
    pub statuses: usize,
}

/// A request in flight on a session.
///
/// Dropping an operation before its terminal status leaves the session
/// desynchronized.
pub struct Operation {
    command: String,
    exchange: Exchange,
    state: OperationState,
    mode: OperationMode,
    last_status: Option<StatusMessage>,
    status_timeout: Option<Duration>,
}

impl Operation {
    /// Sends `request` and claims the session until the operation ends.
    pub(crate) async fn start(session: &Session, request: Message) -> ClientResult<Self> {
        let command = command_get_name(&request).unwrap_or("Unknown").to_string();
        let mut exchange = session.exchange()?;
        exchange.send(&request).await?;

        let mut operation = Self {
            command,
            exchange,
            state: OperationState::Starting,
            mode: OperationMode::Blocking,
            last_status: None,
            status_timeout: session.config().status_timeout(),
        };
        operation.transition(OperationState::Running);
        Ok(operation)
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    /// The most recently received status.
    pub fn last_status(&self) -> Option<&StatusMessage> {
        self.last_status.as_ref()
    }

    fn transition(&mut self, state: OperationState) {
        if self.state == state {
            return;
        }
        info!(
            service = %self.exchange.service(),
            command = %self.command,
            from = ?self.state,
            to = ?state,
            "operation state changed"
        );
        self.state = state;
    }

    /// Receives the next status.
    ///
    /// Returns `None` once a terminal status has been returned or a
    /// receive has failed.
    pub async fn next_status(&mut self) -> Option<ClientResult<StatusMessage>> {
        if self.state.is_terminal() {
            return None;
        }

        let received = match self.exchange.receive(self.status_timeout).await {
            Ok(raw) => StatusMessage::new(raw).map_err(ClientError::from),
            Err(e) => Err(e),
        };

        match received {
            Ok(status) => {
                debug!(
                    command = %self.command,
                    status = status.name().unwrap_or_default(),
                    percent = status.percent_complete(),
                    "status received"
                );
                if status.error().is_some() {
                    self.transition(OperationState::Failed);
                } else if status.is_complete() {
                    self.transition(OperationState::Completed);
                }
                self.last_status = Some(status.clone());
                Some(Ok(status))
            }
            Err(e) => {
                if !e.is_local_close() {
                    self.exchange.mark_desynchronized("operation stopped before its terminal status");
                }
                self.transition(OperationState::Failed);
                Some(Err(e))
            }
        }
    }

    /// Receives statuses until the terminal one.
    ///
    /// A terminal status carrying an error node becomes the matching
    /// [`ClientError`].
    pub async fn wait(mut self) -> ClientResult<OperationOutcome> {
        let mut items: Option<Vec<Message>> = None;
        let mut statuses = 0;

        while let Some(result) = self.next_status().await {
            let status = result?;
            statuses += 1;

            if let Some(page) = status.item_progress().list {
                items.get_or_insert_with(Vec::new).extend(page);
            }
            if let Some(error) = status.error() {
                return Err(ClientError::from_status(error));
            }
            if status.is_complete() {
                return Ok(OperationOutcome {
                    status,
                    items,
                    statuses,
                });
            }
        }

        Err(ClientError::invalid_state(format!(
            "{} operation already finished",
            self.command
        )))
    }

    /// Runs the status loop on a background task.
    ///
    /// `callback` is invoked once per status with the raw message and a
    /// reference to `user_data`. This returns as soon as the task is
    /// spawned, so no callback has fired yet on a single-threaded runtime.
    ///
    /// A failure after this point arrives as one final status carrying an
    /// error node. Closing the session stops the loop without a further
    /// callback.
    pub fn spawn_with_callback<U, F>(
        mut self,
        user_data: U,
        mut callback: F,
    ) -> ClientResult<OperationHandle>
    where
        U: Send + 'static,
        F: FnMut(Message, &U) + Send + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|_| ClientError::invalid_state("callback mode needs a running tokio runtime"))?;
        let command = self.command.clone();
        self.mode = OperationMode::Callback;
        let span = info_span!("operation", service = %self.exchange.service(), command = %command);

        let loop_task = async move {
            while let Some(result) = self.next_status().await {
                match result {
                    Ok(status) => callback(status.into_message(), &user_data),
                    Err(e) if e.is_local_close() => {
                        debug!(command = %self.command, "status loop stopped by session close");
                    }
                    Err(e) => {
                        warn!(command = %self.command, error = %e, "status loop failed");
                        callback(error_status(&e.to_status_error()), &user_data);
                    }
                }
            }
            self.state
        };
        let join = runtime.spawn(loop_task.instrument(span));

        debug!(command = %command, "status loop spawned");
        Ok(OperationHandle { command, join })
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.exchange.mark_desynchronized("operation dropped before its terminal status");
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("command", &self.command)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Handle to a callback-mode operation.
#[derive(Debug)]
pub struct OperationHandle {
    command: String,
    join: JoinHandle<OperationState>,
}

impl OperationHandle {
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the loop to end and returns the final state.
    pub async fn join(self) -> OperationState {
        match self.join.await {
            Ok(state) => state,
            Err(e) => {
                warn!(command = %self.command, error = %e, "status loop task failed");
                OperationState::Failed
            }
        }
    }
}
