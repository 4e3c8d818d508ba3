//! Local feature-flag cache kept in sync with a flag service.
//!
//! A [`FlagStore`] holds a versioned map of flag key to [`FlagRecord`]. It is
//! filled from a full snapshot and then updated from a server push stream
//! (`put`, `patch`, `delete`, `indirect/put`, `indirect/patch`). Versions
//! only move forward per key, so duplicated or reordered events converge to
//! the same state.
//!
//! # Examples
//! ```no_run
//! use flagsync_lib::{FlagStore, PatchDocument, SyncConfig};
//!
//! # async fn run() -> flagsync_lib::Result<()> {
//! let mut config = SyncConfig::load("flagsync.toml");
//! config.apply_env_overrides();
//!
//! let flags = FlagStore::new(config);
//! flags.subscribe(|event| println!("flags changed: {:?}", event.kind));
//! flags.start().await?;
//!
//! if let Some(flag) = flags.get_flag("new-checkout").await {
//!     println!("{} v{} on={}", flag.key, flag.version, flag.on);
//! }
//! flags
//!     .apply_patch("default", "new-checkout", &PatchDocument::toggle("production", true))
//!     .await?;
//! flags.stop();
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod facade;
pub mod flag;
pub mod metrics;
pub mod notifier;
pub mod requestor;
pub mod sse;
pub mod store;
pub mod stream;

pub use api::{HttpManagementApi, ManagementApi, PatchDocument, PatchOperation};
pub use config::{SyncConfig, CONNECTION_SETTINGS};
pub use error::{FlagSyncError, Result};
pub use facade::{FlagStore, HttpTransport, Transport};
pub use flag::{Fallthrough, FlagRecord, Prerequisite, Target};
pub use notifier::{ChangeEvent, ChangeKind, ChangeNotifier, SubscriptionId};
pub use requestor::{HttpRequestor, Requestor};
pub use store::FlagRecordStore;
pub use stream::{ByteStream, ConnectionState, EventSource, HttpEventSource, StreamProcessor};
