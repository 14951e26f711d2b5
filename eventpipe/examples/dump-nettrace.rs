use std::collections::HashMap;

use eventpipe::coreclr::{decode_coreclr_event, CoreClrEvent, SAMPLE_PROFILER_PROVIDER};
use eventpipe::EventPipeParser;

fn main() {
    let path = std::env::args().nth(1).expect("usage: dump-nettrace <file>");
    let bytes = std::fs::read(&path).expect("failed to read trace");

    let mut parser = EventPipeParser::new(&bytes).expect("not a nettrace stream");
    let mut counts: HashMap<String, u64> = HashMap::new();

    while let Some(record) = parser.next_event() {
        let Some(schema) = parser.schema(record.header.metadata_id) else {
            *counts.entry(format!("unknown:{}", record.header.metadata_id)).or_insert(0) += 1;
            continue;
        };
        *counts
            .entry(format!("{}:{}", schema.provider_name, schema.event_id))
            .or_insert(0) += 1;

        if schema.provider_name == SAMPLE_PROFILER_PROVIDER {
            continue;
        }
        match decode_coreclr_event(schema, record.payload, parser.pointer_size()) {
            Ok(Some(CoreClrEvent::MethodLoad(event))) => {
                println!(
                    "MethodLoad: {:#018x} +{:#x} -- {}.{}",
                    event.method_start_address, event.method_size, event.method_namespace, event.method_name
                );
            }
            Ok(Some(CoreClrEvent::GcAllocationTick(event))) => {
                println!("GcAllocationTick: {} ({} bytes)", event.type_name, event.allocation_amount);
            }
            _ => {}
        }
    }

    let tables = parser.into_tables();
    println!("\ntrace info: {:?}", tables.trace_info);
    println!("{} schemas, {} stacks", tables.schemas.len(), tables.stacks.len());
    let mut counts: Vec<_> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    for (key, count) in counts {
        println!("{count:>8}  {key}");
    }
    for error in &tables.errors {
        eprintln!("error: {error}");
    }
}
