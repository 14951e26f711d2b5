//! Hot-method profiles: inclusive and exclusive CPU sample counts per
//! method, derived from the per-stack sample counts after decoding.

use std::collections::{HashMap, HashSet};

use crate::methods::MethodTable;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MethodProfile {
    /// Samples in which the method appears anywhere on the stack.
    pub inclusive_count: u64,
    /// Samples in which the method is the top of the stack.
    pub exclusive_count: u64,
    pub inclusive_time_ms: f64,
    pub exclusive_time_ms: f64,
}

/// One stack visit credits a method's inclusive count at most once, no
/// matter how many frames of the stack resolve to it; the exclusive count
/// goes to the top frame alone.
pub(crate) fn build_method_profiles(
    cpu_samples: &HashMap<u32, u64>,
    stacks: &HashMap<u32, Vec<u64>>,
    methods: &MethodTable,
    sampling_interval_ms: f64,
) -> HashMap<String, MethodProfile> {
    let mut profiles: HashMap<String, MethodProfile> = HashMap::new();

    for (stack_id, &count) in cpu_samples {
        let Some(addresses) = stacks.get(stack_id) else {
            continue;
        };
        let time_ms = count as f64 * sampling_interval_ms;
        let mut seen: HashSet<String> = HashSet::new();
        for (depth, &address) in addresses.iter().enumerate() {
            let name = methods.resolve_name(address);
            let profile = profiles.entry(name.clone()).or_default();
            if depth == 0 {
                profile.exclusive_count += count;
                profile.exclusive_time_ms += time_ms;
            }
            if seen.insert(name) {
                profile.inclusive_count += count;
                profile.inclusive_time_ms += time_ms;
            }
        }
    }

    profiles
}
