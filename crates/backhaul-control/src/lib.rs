//! Control plane for agent tunnels and file transfers
pub mod connection;
pub mod handler;
pub mod service;
pub mod session_registry;
pub mod transfer;
pub mod watchdog;

pub use connection::{HandleError, TunnelHandle};
pub use handler::{ConnectionState, HandlerConfig, HandlerError, TunnelHandler};
pub use service::{ServiceError, TransferService};
pub use session_registry::{ReconcileReport, RegistryError, Session, SessionInfo, SessionRegistry};
pub use transfer::{
    TransferConfig, TransferCoordinator, TransferError, TransferRecord, TransferStatus,
};
pub use watchdog::{spawn_reconcile_task, spawn_transfer_reaper};
