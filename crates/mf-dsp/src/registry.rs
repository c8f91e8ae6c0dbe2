//! Plugin constructor registry, used by GUIs to build "add plugin" menus.

use crate::Plugin;
use crate::delay::{Delay, DelayConfig};
use crate::delay_dynamic::{DelayDynamic, DelayDynamicConfig};
use crate::dynamics::{Compressor, CompressorConfig, Gate, GateConfig};
use crate::filter::{Filter, FilterConfig};
use crate::limiter::{CubicLimiter, LookaheadLimiter, LookaheadLimiterConfig};
use crate::monitor::{MonitorSpectrum, MonitorSpectrumConfig};
use crate::reverb::{Reverb, ReverbConfig};
use crate::rms::{Rms, RmsConfig};
use crate::sampler::{Sampler, SamplerConfig};
use crate::spatial::{Spatialize, SpatializeConfig};

/// One constructible plugin kind.
pub struct RegistryEntry {
    pub name: &'static str,
    pub make: fn() -> Box<dyn Plugin>,
}

/// Every built-in plugin, with default configurations.
pub static REGISTRY: &[RegistryEntry] = &[
    RegistryEntry { name: "RMS", make: || Box::new(Rms::new(RmsConfig::default())) },
    RegistryEntry { name: "Cubic Limiter", make: || Box::new(CubicLimiter::new()) },
    RegistryEntry {
        name: "Lookahead Limiter",
        make: || Box::new(LookaheadLimiter::new(LookaheadLimiterConfig::default())),
    },
    RegistryEntry { name: "Filter", make: || Box::new(Filter::new(FilterConfig::default())) },
    RegistryEntry {
        name: "Compressor",
        make: || Box::new(Compressor::new(CompressorConfig::default())),
    },
    RegistryEntry { name: "Gate", make: || Box::new(Gate::new(GateConfig::default())) },
    RegistryEntry { name: "Delay", make: || Box::new(Delay::new(DelayConfig::default())) },
    RegistryEntry {
        name: "Dynamic Delay",
        make: || Box::new(DelayDynamic::new(DelayDynamicConfig::default())),
    },
    RegistryEntry { name: "Reverb", make: || Box::new(Reverb::new(ReverbConfig::default())) },
    RegistryEntry { name: "Sampler", make: || Box::new(Sampler::new(SamplerConfig::default())) },
    RegistryEntry {
        name: "Spatializer",
        make: || Box::new(Spatialize::new(SpatializeConfig::default())),
    },
    RegistryEntry {
        name: "Spectrum Monitor",
        make: || Box::new(MonitorSpectrum::new(MonitorSpectrumConfig::default())),
    },
];

/// Constructs a plugin by its registry name.
pub fn make_plugin(name: &str) -> Option<Box<dyn Plugin>> {
    REGISTRY.iter().find(|entry| entry.name == name).map(|entry| (entry.make)())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_entry_constructs_with_its_own_name() {
        for entry in REGISTRY {
            let plugin = (entry.make)();
            assert_eq!(plugin.header().name, entry.name);
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(make_plugin("Chorus of Doom").is_none());
        assert!(make_plugin("Reverb").is_some());
    }
}
