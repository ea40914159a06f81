//! Which solver families each device family may run.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolverFamily {
    /// Hand-written GCN assembly taking the problem shape as kernel arguments.
    ImplicitGemmAsmDynamic,
    /// Portable reference kernels compiled from source.
    DirectNaive,
}

impl SolverFamily {
    /// Portable families run on any device and need no table entry.
    pub fn is_portable(self) -> bool {
        matches!(self, SolverFamily::DirectNaive)
    }
}

struct Capability {
    device_prefix: &'static str,
    families: &'static [SolverFamily],
}

const CAPABILITIES: &[Capability] = &[
    Capability {
        device_prefix: "gfx900",
        families: &[SolverFamily::ImplicitGemmAsmDynamic],
    },
    Capability {
        device_prefix: "gfx906",
        families: &[SolverFamily::ImplicitGemmAsmDynamic],
    },
];

/// Whether `family` may run on the device named `device_name`. Device names
/// are matched by prefix, so feature suffixes (`gfx906:sramecc+`) are allowed.
pub fn supports(device_name: &str, family: SolverFamily) -> bool {
    family.is_portable()
        || CAPABILITIES.iter().any(|capability| {
            device_name.starts_with(capability.device_prefix)
                && capability.families.contains(&family)
        })
}

/// Device prefixes with an explicit entry for `family`.
pub fn device_prefixes(family: SolverFamily) -> Vec<&'static str> {
    CAPABILITIES
        .iter()
        .filter(|capability| capability.families.contains(&family))
        .map(|capability| capability.device_prefix)
        .collect()
}
