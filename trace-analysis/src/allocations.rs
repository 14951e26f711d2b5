//! Allocation aggregation: per-type totals, per-stack samples with a
//! per-type breakdown, and the reverse type→stack index used for
//! drill-down from a type to the stacks responsible for it.

use std::collections::HashMap;

/// Count and byte size of a group of allocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeStat {
    pub count: u64,
    pub size: u64,
}

impl TypeStat {
    pub(crate) fn add(&mut self, size: u64) {
        self.count += 1;
        self.size += size;
    }

    pub(crate) fn accumulate(&mut self, other: &TypeStat) {
        self.count += other.count;
        self.size += other.size;
    }
}

/// One GC allocation tick, as retained under its type's aggregate. The
/// stack is resolved to hex address strings in the post-pass.
#[derive(Debug, Clone)]
pub struct AllocationEvent {
    pub type_name: String,
    pub size: u64,
    pub timestamp: u64,
    pub stack_id: u32,
    pub resolved_stack: Option<Vec<String>>,
}

/// Per-type aggregate plus the individual events behind it.
#[derive(Debug, Clone, Default)]
pub struct AllocationInfo {
    pub type_name: String,
    pub count: u64,
    pub total_size: u64,
    pub events: Vec<AllocationEvent>,
}

/// Per-stack aggregate with a per-type breakdown.
#[derive(Debug, Clone, Default)]
pub struct AllocationSamples {
    pub count: u64,
    pub total_size: u64,
    pub types: HashMap<String, TypeStat>,
}

#[derive(Debug, Default)]
pub(crate) struct AllocationAggregator {
    per_type: HashMap<String, AllocationInfo>,
    per_stack: HashMap<u32, AllocationSamples>,
    type_stacks: HashMap<String, HashMap<u32, TypeStat>>,
}

impl AllocationAggregator {
    pub fn record(&mut self, type_name: &str, size: u64, timestamp: u64, stack_id: u32) {
        let info = self
            .per_type
            .entry(type_name.to_string())
            .or_insert_with(|| AllocationInfo {
                type_name: type_name.to_string(),
                ..Default::default()
            });
        info.count += 1;
        info.total_size += size;
        info.events.push(AllocationEvent {
            type_name: type_name.to_string(),
            size,
            timestamp,
            stack_id,
            resolved_stack: None,
        });

        if stack_id > 0 {
            let samples = self.per_stack.entry(stack_id).or_default();
            samples.count += 1;
            samples.total_size += size;
            samples.types.entry(type_name.to_string()).or_default().add(size);

            self.type_stacks
                .entry(type_name.to_string())
                .or_default()
                .entry(stack_id)
                .or_default()
                .add(size);
        }
    }

    #[allow(clippy::type_complexity)]
    pub fn into_tables(
        self,
    ) -> (
        HashMap<String, AllocationInfo>,
        HashMap<u32, AllocationSamples>,
        HashMap<String, HashMap<u32, TypeStat>>,
    ) {
        (self.per_type, self.per_stack, self.type_stacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_type_totals_match_the_event_list() {
        let mut aggregator = AllocationAggregator::default();
        aggregator.record("A", 16, 1, 1);
        aggregator.record("A", 48, 2, 2);
        aggregator.record("B", 8, 3, 0);

        let (per_type, per_stack, type_stacks) = aggregator.into_tables();
        let a = &per_type["A"];
        assert_eq!(a.count, 2);
        assert_eq!(a.total_size, 64);
        assert_eq!(a.events.iter().map(|e| e.size).sum::<u64>(), a.total_size);
        assert_eq!(a.events.len() as u64, a.count);

        // Stack id 0 contributes to the type table only.
        assert_eq!(per_type["B"].count, 1);
        assert!(!per_stack.contains_key(&0));
        assert!(!type_stacks.contains_key("B"));
    }

    #[test]
    fn per_stack_breakdown_and_reverse_index_agree() {
        let mut aggregator = AllocationAggregator::default();
        aggregator.record("A", 16, 1, 5);
        aggregator.record("B", 4, 2, 5);
        aggregator.record("A", 16, 3, 5);

        let (_, per_stack, type_stacks) = aggregator.into_tables();
        let samples = &per_stack[&5];
        assert_eq!(samples.count, 3);
        assert_eq!(samples.total_size, 36);
        assert_eq!(samples.types["A"], TypeStat { count: 2, size: 32 });
        assert_eq!(samples.types["B"], TypeStat { count: 1, size: 4 });

        assert_eq!(type_stacks["A"][&5], TypeStat { count: 2, size: 32 });
        assert_eq!(type_stacks["B"][&5], TypeStat { count: 1, size: 4 });
    }
}
