//! Plugin declaration file: `capability -> [provider_spec]`.
//!
//! Grounded on `original_source/nuvom/plugins/loader.py`'s hybrid loader
//! (legacy `.nuvom_plugins.toml` + entry-point discovery, memoized via
//! `_LOADED`). Rust has no runtime `package.path:Symbol` import, so a
//! `provider_spec` either names one of the compiled-in providers already
//! wired by [`CapabilityRegistry::ensure_builtins`], or the name an
//! external [`Plugin`] was registered under via
//! [`PluginLoader::register_available`] — the declaration file states
//! *which* providers this deployment wants active, rather than
//! dynamically resolving new code. A genuinely external provider needs
//! its own compiled crate linked into the binary ahead of time, not a
//! string import; that's the Rust-native analogue of the Python
//! original's dynamic-import path (`spec.md` §4.1: resolve → instantiate
//! → `major(api_version)` check → `start(config_subset)` → register under
//! `provides[]`), documented as a deviation in `DESIGN.md`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{NuvomError, Result};
use crate::registry::capability::CapabilityRegistry;
use crate::registry::plugin::{major, Plugin, CORE_API_VERSION};

/// Parsed `.nuvom_plugins.toml`: `[plugins] <capability> = ["name", ...]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub plugins: HashMap<String, Vec<String>>,
}

impl PluginManifest {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Self::default());
        }
        let text = tokio::fs::read_to_string(path).await?;
        toml::from_str(&text)
            .map_err(|e| NuvomError::configuration(format!("invalid plugin manifest {}: {e}", path.display())))
    }
}

/// Loads a [`PluginManifest`] against an already-populated
/// [`CapabilityRegistry`], memoizing every spec it has validated so a
/// second call is a no-op (`spec.md` §4.1: "loads external providers
/// exactly once").
#[derive(Default)]
pub struct PluginLoader {
    loaded: RwLock<HashSet<String>>,
    available: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    started: RwLock<Vec<Arc<dyn Plugin>>>,
}

impl PluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an in-process plugin instance resolvable by name. The
    /// Rust-native stand-in for the original's package/entry-point
    /// discovery: a plugin must be linked into the binary and registered
    /// here before `load` can find it.
    pub async fn register_available(&self, plugin: Arc<dyn Plugin>) {
        self.available.write().await.insert(plugin.name().to_string(), plugin);
    }

    /// Validate every declared `(capability, name)` spec and, for each
    /// one not already satisfied by a compiled-in provider, resolve it
    /// against a registered [`Plugin`]: check the protocol
    /// (`provides` lists the capability), check the major API version,
    /// call `start()`, then register the plugin's backend under the
    /// capability registry. Unknown or failing specs are logged and
    /// skipped — errors here are non-fatal during load per `spec.md`
    /// §4.1.
    pub async fn load(&self, manifest: &PluginManifest, registry: &CapabilityRegistry, config: &Config) -> Result<()> {
        for (capability, names) in &manifest.plugins {
            for name in names {
                let spec = format!("{capability}:{name}");
                if self.loaded.read().await.contains(&spec) {
                    continue;
                }

                match self.resolve_and_start(capability.as_str(), name.as_str(), registry, config).await {
                    Ok(()) => {
                        info!(%spec, "plugin declaration resolved");
                        self.loaded.write().await.insert(spec);
                    }
                    Err(e) => {
                        warn!(%spec, error = %e, "plugin declaration did not resolve to a registered provider");
                    }
                }
            }
        }
        Ok(())
    }

    async fn resolve_and_start(
        &self,
        capability: &str,
        name: &str,
        registry: &CapabilityRegistry,
        config: &Config,
    ) -> Result<()> {
        let builtin_present = match capability {
            "queue_backend" => registry.get_queue_backend(Some(name)).await.is_ok(),
            "result_backend" => registry.get_result_backend(Some(name)).await.is_ok(),
            _ => false,
        };
        if builtin_present {
            return Ok(());
        }

        let plugin = self
            .available
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| NuvomError::spec_import_failed(&format!("{capability}:{name}"), "no linked plugin registered under this name"))?;

        if !plugin.provides().iter().any(|c| *c == capability) {
            return Err(NuvomError::protocol_violation(
                plugin.name(),
                format!("plugin does not declare '{capability}' in provides[]"),
            ));
        }

        if major(plugin.api_version()) != major(CORE_API_VERSION) {
            return Err(NuvomError::version_mismatch(plugin.name(), plugin.api_version(), CORE_API_VERSION));
        }

        plugin.start(config)?;
        self.started.write().await.push(plugin.clone());

        match capability {
            "queue_backend" => {
                let backend = plugin
                    .as_queue_backend()
                    .ok_or_else(|| NuvomError::protocol_violation(plugin.name(), "start() succeeded but as_queue_backend() returned None"))?;
                registry.register_queue_backend(name, backend, false).await?;
            }
            "result_backend" => {
                let backend = plugin
                    .as_result_backend()
                    .ok_or_else(|| NuvomError::protocol_violation(plugin.name(), "start() succeeded but as_result_backend() returned None"))?;
                registry.register_result_backend(name, backend, false).await?;
            }
            other => {
                return Err(NuvomError::schedule_misconfigured(format!("unknown capability '{other}' in plugin manifest")));
            }
        }
        Ok(())
    }

    pub async fn is_loaded(&self, capability: &str, name: &str) -> bool {
        self.loaded.read().await.contains(&format!("{capability}:{name}"))
    }

    /// Every plugin that was successfully started, in start order — the
    /// set `stop()` must be called on last during pool shutdown
    /// (`spec.md`:144).
    pub async fn started_plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.started.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::plugin::test_support::HelloPlugin;

    #[tokio::test]
    async fn unresolvable_spec_is_skipped_not_fatal() {
        let registry = CapabilityRegistry::new();
        registry.ensure_builtins(&Config::default()).await.unwrap();

        let mut manifest = PluginManifest::default();
        manifest
            .plugins
            .insert("queue_backend".into(), vec!["redis".into()]);

        let loader = PluginLoader::new();
        loader.load(&manifest, &registry, &Config::default()).await.unwrap();
        assert!(!loader.is_loaded("queue_backend", "redis").await);
    }

    #[tokio::test]
    async fn known_builtin_spec_resolves_and_memoizes() {
        let registry = CapabilityRegistry::new();
        registry.ensure_builtins(&Config::default()).await.unwrap();

        let mut manifest = PluginManifest::default();
        manifest
            .plugins
            .insert("queue_backend".into(), vec!["memory".into()]);

        let loader = PluginLoader::new();
        loader.load(&manifest, &registry, &Config::default()).await.unwrap();
        assert!(loader.is_loaded("queue_backend", "memory").await);
    }

    #[tokio::test]
    async fn compatible_plugin_is_started_and_registered() {
        let registry = CapabilityRegistry::new();
        registry.ensure_builtins(&Config::default()).await.unwrap();

        let plugin = Arc::new(HelloPlugin::new("1.0"));
        let loader = PluginLoader::new();
        loader.register_available(plugin.clone()).await;

        let mut manifest = PluginManifest::default();
        manifest.plugins.insert("queue_backend".into(), vec!["hello".into()]);

        loader.load(&manifest, &registry, &Config::default()).await.unwrap();

        assert!(loader.is_loaded("queue_backend", "hello").await);
        assert!(plugin.was_started());
        assert!(registry.get_queue_backend(Some("hello")).await.is_ok());
        assert_eq!(loader.started_plugins().await.len(), 1);
    }

    #[tokio::test]
    async fn plugin_with_incompatible_major_version_is_skipped() {
        let registry = CapabilityRegistry::new();
        registry.ensure_builtins(&Config::default()).await.unwrap();

        let plugin = Arc::new(HelloPlugin::new("2.0"));
        let loader = PluginLoader::new();
        loader.register_available(plugin.clone()).await;

        let mut manifest = PluginManifest::default();
        manifest.plugins.insert("queue_backend".into(), vec!["hello".into()]);

        loader.load(&manifest, &registry, &Config::default()).await.unwrap();

        assert!(!loader.is_loaded("queue_backend", "hello").await);
        assert!(!plugin.was_started());
        assert!(registry.get_queue_backend(Some("hello")).await.is_err());
    }

    #[tokio::test]
    async fn plugin_not_declaring_requested_capability_is_a_protocol_violation() {
        let registry = CapabilityRegistry::new();
        registry.ensure_builtins(&Config::default()).await.unwrap();

        let plugin = Arc::new(HelloPlugin::new("1.0"));
        let loader = PluginLoader::new();
        loader.register_available(plugin.clone()).await;

        let mut manifest = PluginManifest::default();
        manifest.plugins.insert("result_backend".into(), vec!["hello".into()]);

        loader.load(&manifest, &registry, &Config::default()).await.unwrap();

        assert!(!loader.is_loaded("result_backend", "hello").await);
        assert!(!plugin.was_started());
    }
}
