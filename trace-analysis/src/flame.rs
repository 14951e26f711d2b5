//! Flame-graph construction. Stacks insert root-first into a tree of
//! weighted nodes; the flattened layout assigns every node a `[0,1]`
//! interval, children splitting their parent's interval proportionally to
//! weight in descending order so the layout is stable across runs.

use std::collections::{BTreeMap, HashMap};

use crate::allocations::{AllocationSamples, TypeStat};
use crate::methods::MethodTable;

#[derive(Debug, Clone, Default)]
pub struct FlameNode {
    pub name: String,
    /// Sum of the weights of all stacks passing through this node.
    pub weight: u64,
    /// Allocation variant only: bytes attributed to this node.
    pub total_size: u64,
    /// Allocation variant only: contributing type names.
    pub types: BTreeMap<String, TypeStat>,
    pub children: BTreeMap<String, FlameNode>,
}

impl FlameNode {
    fn named(name: &str) -> Self {
        FlameNode {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn child(&mut self, name: &str) -> &mut FlameNode {
        self.children
            .entry(name.to_string())
            .or_insert_with(|| FlameNode::named(name))
    }

    fn add(&mut self, weight: u64, size: u64, types: Option<&HashMap<String, TypeStat>>) {
        self.weight += weight;
        self.total_size += size;
        if let Some(types) = types {
            for (type_name, stat) in types {
                self.types
                    .entry(type_name.clone())
                    .or_default()
                    .accumulate(stat);
            }
        }
    }
}

/// One node of the flattened layout. `start`/`end` are fractions of the
/// root's width; depth 0 is the root itself.
#[derive(Debug, Clone, PartialEq)]
pub struct FlameGraphNode {
    pub name: String,
    pub depth: u32,
    pub weight: u64,
    pub total_size: u64,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Default)]
pub struct FlameGraph {
    pub root: FlameNode,
    pub nodes: Vec<FlameGraphNode>,
}

/// CPU variant: every distinct sampled stack weighs 1.
pub(crate) fn build_cpu_flame(
    cpu_samples: &HashMap<u32, u64>,
    stacks: &HashMap<u32, Vec<u64>>,
    methods: &MethodTable,
) -> FlameGraph {
    let mut root = FlameNode::named("root");
    let mut stack_ids: Vec<&u32> = cpu_samples.keys().collect();
    stack_ids.sort_unstable();
    for stack_id in stack_ids {
        let Some(addresses) = stacks.get(stack_id) else {
            continue;
        };
        insert_stack(&mut root, addresses, methods, 1, 0, None);
    }
    flatten(root)
}

/// Allocation variant: each stack weighs its allocation count and carries
/// byte sizes and the per-type breakdown onto every node it touches.
pub(crate) fn build_allocation_flame(
    allocation_samples: &HashMap<u32, AllocationSamples>,
    stacks: &HashMap<u32, Vec<u64>>,
    methods: &MethodTable,
) -> FlameGraph {
    let mut root = FlameNode::named("root");
    let mut stack_ids: Vec<&u32> = allocation_samples.keys().collect();
    stack_ids.sort_unstable();
    for stack_id in stack_ids {
        let Some(addresses) = stacks.get(stack_id) else {
            continue;
        };
        let samples = &allocation_samples[stack_id];
        insert_stack(
            &mut root,
            addresses,
            methods,
            samples.count,
            samples.total_size,
            Some(&samples.types),
        );
    }
    flatten(root)
}

/// Stacks arrive top-of-stack first; the tree wants the deepest caller at
/// the root, so the walk is in reverse.
fn insert_stack(
    root: &mut FlameNode,
    addresses: &[u64],
    methods: &MethodTable,
    weight: u64,
    size: u64,
    types: Option<&HashMap<String, TypeStat>>,
) {
    root.add(weight, size, types);
    let mut node = root;
    for &address in addresses.iter().rev() {
        let name = methods.resolve_name(address);
        node = node.child(&name);
        node.add(weight, size, types);
    }
}

fn flatten(root: FlameNode) -> FlameGraph {
    let mut nodes = Vec::new();
    walk(&root, 0, 0.0, 1.0, &mut nodes);
    FlameGraph { root, nodes }
}

fn walk(node: &FlameNode, depth: u32, start: f64, end: f64, out: &mut Vec<FlameGraphNode>) {
    out.push(FlameGraphNode {
        name: node.name.clone(),
        depth,
        weight: node.weight,
        total_size: node.total_size,
        start,
        end,
    });
    if node.weight == 0 || node.children.is_empty() {
        return;
    }

    let mut children: Vec<&FlameNode> = node.children.values().collect();
    children.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));

    let span = end - start;
    let mut cursor = start;
    for child in children {
        let width = span * child.weight as f64 / node.weight as f64;
        walk(child, depth + 1, cursor, cursor + width, out);
        cursor += width;
    }
}
