pub mod batch;
pub mod cache;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod side_channel;
pub mod waiter;

// Re-export the types most callers need
pub use batch::{BatchInput, BatchRequest, Row};
pub use cache::{Fingerprint, Resolved};
pub use client::{Client, ClientContext, Results};
pub use config::{ClientSettings, SettingsOverlay, resolve_settings};
pub use correlator::{LogProgress, ProgressObserver};
pub use error::{ClientError, ClientResult};
pub use protocol::ProgressUpdate;
pub use registry::{MethodSpec, MethodTable};
pub use runtime::{BackgroundCall, ExecutionContext};
pub use session::ConnectionState;
