//! Plugin contract: the shape a third-party capability provider must
//! satisfy (`spec.md` §4.1, §7).
//!
//! Grounded on `original_source/nuvom/plugins/contracts.py`'s `Plugin`
//! protocol (`api_version`/`name`/`provides`/`requires` plus
//! `start`/`stop`) and `nuvom-hello-plugin`'s reference implementation.
//! Rust has no runtime `package.path:Symbol` import, so "resolving a
//! spec" here means looking up an `Arc<dyn Plugin>` that was linked into
//! the binary and handed to a [`super::manifest::PluginLoader`] via
//! [`super::manifest::PluginLoader::register_available`] ahead of time —
//! the version check, `start()` call, and capability registration proceed
//! exactly as `spec.md` §4.1 describes from there.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::queue::QueueBackend;
use crate::result::ResultBackend;

/// Core's plugin protocol version; a plugin only loads if its
/// `api_version`'s major component matches this one's (`spec.md` §4.1:
/// "verify `major(api_version) == major(core_api_version)`").
pub const CORE_API_VERSION: &str = "1.0";

/// Formal contract every capability provider implements.
///
/// Object-safe so a resolved provider can be stored as `Arc<dyn Plugin>`.
/// A plugin exposes whichever backend(s) it implements via
/// `as_queue_backend`/`as_result_backend`; the default `None` lets a
/// plugin that only provides one capability skip the other.
pub trait Plugin: Send + Sync {
    /// `major.minor` (or more) version string, checked against
    /// [`CORE_API_VERSION`] before `start()` is ever called.
    fn api_version(&self) -> &str;
    /// Unique identifier this plugin registers under.
    fn name(&self) -> &str;
    /// Capabilities this plugin offers, e.g. `["queue_backend"]`.
    fn provides(&self) -> &[&'static str];
    /// Capabilities this plugin depends on. Informational only — the
    /// loader does not currently sequence loading by `requires`.
    fn requires(&self) -> &[&'static str] {
        &[]
    }
    /// Called once, after the version check passes and before this
    /// plugin's providers are registered into the capability registry.
    fn start(&self, settings: &Config) -> Result<()>;
    /// Called once during pool shutdown, after every provider this
    /// plugin registered is asked to `stop()` last (`spec.md`:144).
    fn stop(&self) -> Result<()> {
        Ok(())
    }
    fn as_queue_backend(&self) -> Option<Arc<dyn QueueBackend>> {
        None
    }
    fn as_result_backend(&self) -> Option<Arc<dyn ResultBackend>> {
        None
    }
}

/// The leading dot-separated component of a version string:
/// `major("1.4.2") == "1"`.
pub fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::queue::memory::MemoryQueue;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Minimal stand-in for `nuvom-hello-plugin`'s `HelloPlugin`, used to
    /// exercise the loader's version-check/start/stop wiring without a
    /// real external crate.
    pub struct HelloPlugin {
        pub api_version: String,
        started: AtomicBool,
        stopped: AtomicBool,
    }

    impl HelloPlugin {
        pub fn new(api_version: impl Into<String>) -> Self {
            Self { api_version: api_version.into(), started: AtomicBool::new(false), stopped: AtomicBool::new(false) }
        }

        pub fn was_started(&self) -> bool {
            self.started.load(Ordering::SeqCst)
        }

        pub fn was_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    impl Plugin for HelloPlugin {
        fn api_version(&self) -> &str {
            &self.api_version
        }

        fn name(&self) -> &str {
            "hello"
        }

        fn provides(&self) -> &[&'static str] {
            &["queue_backend"]
        }

        fn start(&self, _settings: &Config) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn as_queue_backend(&self) -> Option<Arc<dyn QueueBackend>> {
            Some(Arc::new(MemoryQueue::new(0)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_extracts_leading_component() {
        assert_eq!(major("1.4.2"), "1");
        assert_eq!(major("2"), "2");
    }
}
