//! Event descriptions and name resolution.

pub mod hw;

use crate::ffi::bindings as b;

pub use hw::Hardware;

/// Raw knobs that select what a counter measures, independent of how it
/// is scheduled or read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventConfig {
    pub ty: u32,
    pub config: u64,
    pub config1: u64,
    pub config2: u64,
}

/// An event as named by the caller, resolved to its raw configuration.
///
/// The name is kept because privilege-level qualifiers ride along in it:
/// an event opened as `instructions:u=1` pins its own user-mode mask and
/// must not be overridden by the set-wide domain.
#[derive(Clone, Debug)]
pub struct NativeEvent {
    pub name: String,
    pub config: EventConfig,
    /// Pins the event to one CPU; `None` follows the set's target.
    pub cpu: Option<u32>,
}

impl NativeEvent {
    pub fn new(name: impl Into<String>, config: EventConfig) -> Self {
        Self {
            name: name.into(),
            config,
            cpu: None,
        }
    }

    pub fn on_cpu(mut self, cpu: u32) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// The name carries its own user-mode qualifier.
    pub fn has_user_mask(&self) -> bool {
        self.name.contains(":u=")
    }

    /// The name carries its own kernel-mode qualifier.
    pub fn has_kernel_mask(&self) -> bool {
        self.name.contains(":k=")
    }
}

/// Resolves event names to native events.
///
/// The generalized table below covers the portable names; a
/// PMU-specific table can sit in front of it, and may pin a resolved
/// event to a CPU.
pub trait EventTable {
    fn resolve(&self, name: &str) -> Option<NativeEvent>;
}

/// Name table over a fixed slice, for the architecture-independent events.
pub struct StaticEventTable {
    entries: &'static [(&'static str, EventConfig)],
}

const HW: u32 = b::PERF_TYPE_HARDWARE;
const SW: u32 = b::PERF_TYPE_SOFTWARE;

const fn entry(ty: u32, config: u64) -> EventConfig {
    EventConfig {
        ty,
        config,
        config1: 0,
        config2: 0,
    }
}

pub static GENERALIZED_EVENTS: StaticEventTable = StaticEventTable {
    entries: &[
        ("cycles", entry(HW, b::PERF_COUNT_HW_CPU_CYCLES)),
        ("instructions", entry(HW, b::PERF_COUNT_HW_INSTRUCTIONS)),
        ("cache-references", entry(HW, b::PERF_COUNT_HW_CACHE_REFERENCES)),
        ("cache-misses", entry(HW, b::PERF_COUNT_HW_CACHE_MISSES)),
        ("branches", entry(HW, b::PERF_COUNT_HW_BRANCH_INSTRUCTIONS)),
        ("branch-misses", entry(HW, b::PERF_COUNT_HW_BRANCH_MISSES)),
        ("bus-cycles", entry(HW, b::PERF_COUNT_HW_BUS_CYCLES)),
        ("stalled-cycles-frontend", entry(HW, b::PERF_COUNT_HW_STALLED_CYCLES_FRONTEND)),
        ("stalled-cycles-backend", entry(HW, b::PERF_COUNT_HW_STALLED_CYCLES_BACKEND)),
        ("ref-cycles", entry(HW, b::PERF_COUNT_HW_REF_CPU_CYCLES)),
        ("cpu-clock", entry(SW, b::PERF_COUNT_SW_CPU_CLOCK)),
        ("task-clock", entry(SW, b::PERF_COUNT_SW_TASK_CLOCK)),
        ("page-faults", entry(SW, b::PERF_COUNT_SW_PAGE_FAULTS)),
        ("context-switches", entry(SW, b::PERF_COUNT_SW_CONTEXT_SWITCHES)),
        ("cpu-migrations", entry(SW, b::PERF_COUNT_SW_CPU_MIGRATIONS)),
        ("minor-faults", entry(SW, b::PERF_COUNT_SW_PAGE_FAULTS_MIN)),
        ("major-faults", entry(SW, b::PERF_COUNT_SW_PAGE_FAULTS_MAJ)),
    ],
};

impl EventTable for StaticEventTable {
    fn resolve(&self, name: &str) -> Option<NativeEvent> {
        // Qualifiers after the first ':' do not take part in the
        // lookup, but the returned event keeps the full name so they
        // still steer the domain masks.
        let base = name.split(':').next().unwrap_or(name);
        self.entries
            .iter()
            .find(|(n, _)| *n == base)
            .map(|(_, config)| NativeEvent::new(name, *config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generalized_lookup() {
        let event = GENERALIZED_EVENTS.resolve("instructions").unwrap();
        assert_eq!(event.config.ty, b::PERF_TYPE_HARDWARE);
        assert_eq!(event.config.config, b::PERF_COUNT_HW_INSTRUCTIONS);
        assert_eq!(event.cpu, None);

        let event = GENERALIZED_EVENTS.resolve("page-faults").unwrap();
        assert_eq!(event.config.ty, b::PERF_TYPE_SOFTWARE);

        assert!(GENERALIZED_EVENTS.resolve("no-such-event").is_none());
    }

    #[test]
    fn qualifiers_do_not_break_lookup() {
        let plain = GENERALIZED_EVENTS.resolve("cycles").unwrap();
        let qualified = GENERALIZED_EVENTS.resolve("cycles:u=1").unwrap();
        assert_eq!(plain.config, qualified.config);
        // The qualified name survives resolution.
        assert_eq!(qualified.name, "cycles:u=1");
    }

    #[test]
    fn mask_qualifiers_detected_by_name() {
        let plain = GENERALIZED_EVENTS.resolve("cycles").unwrap();
        assert!(!plain.has_user_mask());
        assert!(!plain.has_kernel_mask());

        let user = GENERALIZED_EVENTS.resolve("cycles:u=1").unwrap();
        assert!(user.has_user_mask());
        assert!(!user.has_kernel_mask());

        let kernel = GENERALIZED_EVENTS.resolve("cycles:k=0").unwrap();
        assert!(kernel.has_kernel_mask());
    }

    #[test]
    fn hardware_cache_encoding() {
        use hw::{Op, OpResult, Type};
        let config = EventConfig::from(Hardware::Cache(Type::L1d, Op::Read, OpResult::Miss));
        assert_eq!(config.ty, b::PERF_TYPE_HW_CACHE);
        assert_eq!(
            config.config,
            b::PERF_COUNT_HW_CACHE_L1D
                | (b::PERF_COUNT_HW_CACHE_OP_READ << 8)
                | (b::PERF_COUNT_HW_CACHE_RESULT_MISS << 16)
        );
    }

    #[test]
    fn cpu_pinning_rides_the_event() {
        let event = GENERALIZED_EVENTS.resolve("cycles").unwrap().on_cpu(2);
        assert_eq!(event.cpu, Some(2));
    }
}
