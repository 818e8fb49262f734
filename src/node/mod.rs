//! Node Side
//!
//! Mount-table inspection, host adapters and the mount reconciler that
//! implements NodePublish/NodeUnpublish.

pub mod bypath;
pub mod host;
pub mod initiator;
pub mod mount_table;
pub mod reconciler;

pub use host::{BrokeredHost, LocalHost, LocalHostConfig};
pub use mount_table::{MountRecord, MountTableConfig, MountTableReader, TransportKind};
pub use reconciler::{MountReconciler, ReconcilerConfig};
