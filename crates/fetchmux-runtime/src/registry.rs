//! Source kind registry.
//!
//! Maps the `kind` of a `[[source]]` entry to the constructor that turns it
//! into a `LogSource`. Built once at startup and passed to the daemon.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;

use fetchmux_fetch::LogSource;

use crate::config::SourceConfig;
use crate::json_source::JsonHttpSource;

pub type SourceFactory = fn(&SourceConfig) -> anyhow::Result<Arc<dyn LogSource>>;

#[derive(Default)]
pub struct SourceRegistry {
    factories: BTreeMap<&'static str, SourceFactory>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every kind shipped in this binary.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("json_http", JsonHttpSource::factory);
        registry
    }

    /// Register `factory` for `kind`, returning the one it replaced.
    pub fn register(&mut self, kind: &'static str, factory: SourceFactory) -> Option<SourceFactory> {
        self.factories.insert(kind, factory)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    pub fn build(&self, cfg: &SourceConfig) -> anyhow::Result<Arc<dyn LogSource>> {
        let factory = self.factories.get(cfg.kind.as_str()).ok_or_else(|| {
            anyhow!(
                "source {:?}: unknown kind {:?} (known: {})",
                cfg.name,
                cfg.kind,
                self.kinds().collect::<Vec<_>>().join(", ")
            )
        })?;
        factory(cfg)
    }
}
