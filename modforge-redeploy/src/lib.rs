//! Watches auto-redeploy module directories and drives a
//! [`modforge_module::Reloader`] once a module's directory has gone
//! quiet after a change.
//!
//! Two engines implement the same [`modforge_module::RedeployObserver`]
//! seam: [`NativeWatcherRedeployer`] (backed by `notify`, the default)
//! and [`PollingRedeployer`] (a directory-walk fallback for filesystems
//! or containers where native watches are unreliable). Neither crate
//! depends on the other's presence; `modforge-cli` picks one at startup.

pub mod error;
pub mod native;
pub mod polling;

pub use error::{RedeployError, RedeployResult};
pub use native::NativeWatcherRedeployer;
pub use polling::PollingRedeployer;

use std::time::Duration;

/// Default quiescence window before a changed module is reloaded
/// (spec.md §4.9). Chosen to match the debounce window the teacher's
/// own file watcher uses for its rebuild trigger.
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(2);
