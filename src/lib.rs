//! User-space gateway exposing pluggable block-storage handlers as
//! readable/writable files in a synthetic FUSE filesystem.
//!
//! The gateway keeps a process-owned [tree](crate::tree) of named nodes and
//! mounts it through the kernel FUSE bridge. Storage handlers are loaded
//! into a fixed-capacity [registry](crate::registry), bound to minors in the
//! [device table](crate::device), and driven through the
//! [I/O bridge](crate::bridge), which turns each synchronous filesystem
//! request into an asynchronous handler command and blocks on its
//! completion. A distinguished control node (`/dev/tcmur` by default)
//! accepts line-oriented commands that reshape all of the above; see
//! [`control`](crate::control).

#![warn(missing_docs, rust_2018_idioms)]

pub mod bridge;
pub mod control;
pub mod device;
pub mod error;
pub mod fs;
pub mod handler;
pub mod handlers;
pub mod loader;
pub mod registry;
pub mod stubs;
pub mod sync;
pub mod tree;
mod worker;

pub use crate::bridge::{DeviceFileOps, IoBridge};
pub use crate::control::Controller;
pub use crate::device::{Device, DeviceTable};
pub use crate::error::{Error, Result};
pub use crate::fs::GatewayFs;
pub use crate::handler::{CmdKind, CmdStatus, Command, Handler, HandlerRegistrar, SgList};
pub use crate::registry::HandlerRegistry;
pub use crate::tree::{FileOps, NodeId, NodeKind, Vft};

/// Default mountpoint of the gateway filesystem.
pub const DEFAULT_MOUNTPOINT: &str = "/tcmur";

/// Default name of the control node under `/dev`.
pub const DEFAULT_CTL_NAME: &str = "tcmur";

/// Default path prefix handler modules are loaded from.
pub const DEFAULT_HANDLER_PREFIX: &str = "/usr/local/lib/tcmu-runner/handler_";
