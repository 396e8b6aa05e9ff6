//! Read-only terminal viewer for running Jupyter kernels.
//!
//! `nbattach` finds a kernel that is already running (from a notebook path,
//! a kernel id or a connection file), opens an authenticated session on its
//! channels and relays everything the kernel broadcasts on iopub to the
//! terminal as it arrives. It never executes code and never restarts the
//! kernel.
//!
//! The pipeline, leaf first:
//!
//! - [`locator`] resolves a target to one live [`connection::ConnectionDescriptor`]
//! - [`channels`] opens the kernel channels and returns a [`session::Session`]
//! - [`wire`] frames, signs and verifies every message
//! - [`dispatch`] turns iopub messages into [`dispatch::OutputEvent`]s
//! - [`render`] turns events into terminal text
//! - [`heartbeat`] watches liveness and ends the session when the kernel dies
//!
//! [`attach::attach`] wires these together.

pub mod attach;
pub mod channels;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod dump;
pub mod error;
pub mod heartbeat;
pub mod locator;
pub mod render;
pub mod session;
pub mod wire;

pub use attach::{attach, relay_session, Relay, RelayEnd};
pub use config::{load_config, load_config_from, AttachConfig};
pub use connection::ConnectionDescriptor;
pub use error::{AttachError, CodecError, LocatorError};
pub use heartbeat::LivenessState;
pub use locator::{KernelTarget, Located, Locator};
pub use session::Session;
