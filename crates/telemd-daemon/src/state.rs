//! Daemon context shared by every handler invocation.
//!
//! Built once at startup and passed by reference; there is no global
//! mutable state.

use telemd_core::config::CollectorConfig;
use telemd_core::{HeaderRegistry, MachineIdentity, RecordLimits, Stager};

/// Everything a record handler needs.
#[derive(Debug)]
pub struct DaemonContext {
    config: CollectorConfig,
    registry: HeaderRegistry,
    limits: RecordLimits,
    identity: MachineIdentity,
    stager: Stager,
}

impl DaemonContext {
    /// Build a context with the default header registry.
    ///
    /// Reads the machine-id override file once.
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        Self::with_registry(config, HeaderRegistry::default())
    }

    /// Build a context for a custom header registry.
    #[must_use]
    pub fn with_registry(config: CollectorConfig, registry: HeaderRegistry) -> Self {
        let identity = MachineIdentity::load(&config.identity);
        Self::from_parts(config, registry, identity)
    }

    /// Assemble a context from an already loaded identity.
    #[must_use]
    pub fn from_parts(
        config: CollectorConfig,
        registry: HeaderRegistry,
        identity: MachineIdentity,
    ) -> Self {
        let limits = config.limits.record_limits(&registry);
        let stager = Stager::new(&config.daemon.spool_dir);
        Self {
            config,
            registry,
            limits,
            identity,
            stager,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Header registry records are validated against.
    #[must_use]
    pub const fn registry(&self) -> &HeaderRegistry {
        &self.registry
    }

    /// Size limits derived from the registry and configuration.
    #[must_use]
    pub const fn limits(&self) -> &RecordLimits {
        &self.limits
    }

    /// Machine identity stamped into every record.
    #[must_use]
    pub const fn identity(&self) -> &MachineIdentity {
        &self.identity
    }

    /// Spool writer.
    #[must_use]
    pub const fn stager(&self) -> &Stager {
        &self.stager
    }
}
