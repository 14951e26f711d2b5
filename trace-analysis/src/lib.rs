//! Analytical model over .NET EventPipe traces.
//!
//! [`parse`] runs the nettrace decoder over a fully buffered trace and
//! aggregates the well-known CLR events into per-type allocation totals,
//! per-stack CPU sample and allocation aggregates, a JIT method address
//! map, hot-method profiles and flame-graph trees. The produced
//! [`TraceAnalysis`] is frozen on return; decoding problems surface as
//! entries in its error list, never as a panic or an early abort.

mod allocations;
mod flame;
mod methods;
mod profile;

use std::collections::{BTreeSet, HashMap};

use eventpipe::coreclr::{decode_coreclr_event, CoreClrEvent};
use eventpipe::EventPipeParser;

pub use allocations::{AllocationEvent, AllocationInfo, AllocationSamples, TypeStat};
pub use eventpipe::{EventSchema, FieldSchema, MetadataTypeCode, NettraceError, TraceInfo, TraceTime};
pub use flame::{FlameGraph, FlameGraphNode, FlameNode};
pub use methods::{MethodRecord, MethodTable};
pub use profile::MethodProfile;

use allocations::AllocationAggregator;

/// Global counters over the whole trace.
#[derive(Debug, Default)]
pub struct TraceStats {
    pub total_events: u64,
    pub allocation_events: u64,
    pub providers: BTreeSet<String>,
}

/// Everything derived from one trace. All tables are final; callers that
/// fan analysis out must treat the value as read-only.
#[derive(Debug, Default)]
pub struct TraceAnalysis {
    pub trace_info: Option<TraceInfo>,
    /// Event schemas by metadata id.
    pub schemas: HashMap<u32, EventSchema>,
    /// Allocation aggregates by type name.
    pub allocations: HashMap<String, AllocationInfo>,
    /// Stack samples by stack id, top of stack first.
    pub stacks: HashMap<u32, Vec<u64>>,
    /// JIT method records by id plus the address-interval index.
    pub methods: MethodTable,
    /// Hot-method profiles by full method name.
    pub method_profiles: HashMap<String, MethodProfile>,
    /// Allocation aggregates by stack id.
    pub allocation_samples: HashMap<u32, AllocationSamples>,
    /// Reverse index: type name to the stacks allocating it.
    pub type_stacks: HashMap<String, HashMap<u32, TypeStat>>,
    /// CPU sample counts by stack id.
    pub cpu_samples: HashMap<u32, u64>,
    /// Event counts keyed "provider:eventId", or "unknown:<metadataId>"
    /// for events whose metadata id never resolved.
    pub event_counts: HashMap<String, u64>,
    pub stats: TraceStats,
    pub cpu_flame: FlameGraph,
    pub allocation_flame: FlameGraph,
    /// One entry per recovered decoding problem; empty for a clean trace.
    pub errors: Vec<String>,
}

/// Decodes a complete nettrace byte stream and builds the analytical
/// model. A bad magic or serialization banner yields an otherwise-empty
/// result carrying a single error; anything else decodes as far as the
/// bytes allow.
pub fn parse(bytes: &[u8]) -> TraceAnalysis {
    let mut analysis = TraceAnalysis::default();
    let mut parser = match EventPipeParser::new(bytes) {
        Ok(parser) => parser,
        Err(err) => {
            analysis.errors.push(err.to_string());
            return analysis;
        }
    };

    let mut counts_by_metadata: HashMap<u32, u64> = HashMap::new();
    let mut aggregator = AllocationAggregator::default();

    while let Some(record) = parser.next_event() {
        analysis.stats.total_events += 1;
        *counts_by_metadata
            .entry(record.header.metadata_id)
            .or_insert(0) += 1;

        let Some(schema) = parser.schema(record.header.metadata_id) else {
            continue;
        };
        match decode_coreclr_event(schema, record.payload, parser.pointer_size()) {
            Ok(Some(CoreClrEvent::GcAllocationTick(tick))) => {
                analysis.stats.allocation_events += 1;
                aggregator.record(
                    &tick.type_name,
                    tick.allocation_amount,
                    record.header.timestamp,
                    record.header.stack_id,
                );
            }
            Ok(Some(CoreClrEvent::MethodLoad(event)))
            | Ok(Some(CoreClrEvent::MethodDCEnd(event))) => {
                analysis.methods.insert(MethodRecord::from(event));
            }
            Ok(Some(CoreClrEvent::MethodJittingStarted(event))) => {
                analysis.methods.insert_if_absent(MethodRecord::from(event));
            }
            Ok(Some(CoreClrEvent::SampleProfilerTick)) => {
                if record.header.stack_id > 0 {
                    *analysis
                        .cpu_samples
                        .entry(record.header.stack_id)
                        .or_insert(0) += 1;
                }
            }
            Ok(None) => {}
            Err(err) => {
                analysis
                    .errors
                    .push(format!("{}:{}: {err}", schema.provider_name, schema.event_id));
            }
        }
    }

    let tables = parser.into_tables();
    analysis.trace_info = tables.trace_info;
    analysis.schemas = tables.schemas;
    analysis.stacks = tables.stacks;
    analysis.errors.extend(tables.errors);

    for schema in analysis.schemas.values() {
        analysis.stats.providers.insert(schema.provider_name.clone());
    }
    for (metadata_id, count) in counts_by_metadata {
        let key = match analysis.schemas.get(&metadata_id) {
            Some(schema) => format!("{}:{}", schema.provider_name, schema.event_id),
            None => format!("unknown:{metadata_id}"),
        };
        *analysis.event_counts.entry(key).or_insert(0) += count;
    }

    let (mut per_type, allocation_samples, type_stacks) = aggregator.into_tables();
    for info in per_type.values_mut() {
        for event in &mut info.events {
            if event.stack_id > 0 {
                if let Some(addresses) = analysis.stacks.get(&event.stack_id) {
                    event.resolved_stack = Some(
                        addresses
                            .iter()
                            .map(|address| format!("{address:#x}"))
                            .collect(),
                    );
                }
            }
        }
    }
    analysis.allocations = per_type;
    analysis.allocation_samples = allocation_samples;
    analysis.type_stacks = type_stacks;

    analysis.methods.build_address_index();

    let sampling_interval_ms = sampling_interval_ms(analysis.trace_info.as_ref());
    analysis.method_profiles = profile::build_method_profiles(
        &analysis.cpu_samples,
        &analysis.stacks,
        &analysis.methods,
        sampling_interval_ms,
    );
    analysis.cpu_flame =
        flame::build_cpu_flame(&analysis.cpu_samples, &analysis.stacks, &analysis.methods);
    analysis.allocation_flame = flame::build_allocation_flame(
        &analysis.allocation_samples,
        &analysis.stacks,
        &analysis.methods,
    );

    log::debug!(
        "trace analyzed: {} events, {} schemas, {} stacks, {} methods, {} errors",
        analysis.stats.total_events,
        analysis.schemas.len(),
        analysis.stacks.len(),
        analysis.methods.len(),
        analysis.errors.len()
    );
    analysis
}

/// The trace header advertises the sample-profiler cadence; the .NET
/// default is one sample per millisecond. Zero or absent falls back to
/// 1 ms so estimated times stay finite.
fn sampling_interval_ms(trace_info: Option<&TraceInfo>) -> f64 {
    match trace_info {
        Some(info) if info.expected_cpu_sampling_rate > 0 => {
            f64::from(info.expected_cpu_sampling_rate)
        }
        _ => 1.0,
    }
}
