//! Sessions, long-running operations and service clients
//!
//! This crate talks to device services over a [`Session`]: the
//! installation proxy ([`InstallationProxy`]) and mobile backup
//! ([`MobileBackup`]).

pub mod backup;
pub mod config;
pub mod device;
pub mod error;
pub mod installation;
pub mod operation;
pub mod session;

pub use backup::{MobileBackup, RestoreFlags};
pub use config::ClientConfig;
pub use device::{
    BoxFuture, BoxedConnection, Connection, Connector, DeviceRef, Lockdown, ServiceDescriptor,
    TcpConnector,
};
pub use error::{ClientError, ClientResult, ErrorKind, OrException, ServiceException};
pub use installation::InstallationProxy;
pub use operation::{Operation, OperationHandle, OperationMode, OperationOutcome, OperationState};
pub use session::Session;
