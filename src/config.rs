//! Configuration surface (spec §6): the data the core's launcher is
//! configured with. Parsing command-line flags or a boot script into
//! these types is the launcher binary's job, not this crate's — these
//! are plain data contracts, the same division
//! `examples/vzwjustin-Rustos` draws between its `KernelConfig` data and
//! whatever reads `/proc/cmdline` to build one.

use alloc::string::String;
use alloc::vec::Vec;

/// Per-client binding: which capability name a client attaches through,
/// which physical or partition device it is bound to, and the limits
/// placed on that binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientBinding {
    pub capability_name: String,
    pub device_uuid: String,
    pub max_dataspaces: u32,
    pub read_only_flag: bool,
    /// Overrides the bound device's own `max_in_flight()` when present.
    pub max_in_flight_override: Option<u32>,
}

/// Feature disables, e.g. for working around a quirky controller or a
/// host environment that can't deliver MSI-X.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureDisables {
    pub no_sgl: bool,
    pub no_msi: bool,
    pub no_msix: bool,
}

/// Top-level launcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    pub verbosity: log::LevelFilter,
    /// Force 32-bit-only DMA addressing even on a controller that would
    /// otherwise advertise 64-bit capability (spec §4.2's address-width
    /// guarantee, made an explicit operator override).
    pub address_width_override: Option<u8>,
    pub bindings: Vec<ClientBinding>,
    pub features: FeatureDisables,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            verbosity: log::LevelFilter::Info,
            address_width_override: None,
            bindings: Vec::new(),
            features: FeatureDisables::default(),
        }
    }
}
