//! Payload parsers for the event kinds the analytical model consumes:
//! GC allocation ticks, JIT method address ranges, and sample-profiler
//! ticks. Everything else stays an anonymous counter bump for the caller.

use std::io::Cursor;

use binrw::{BinRead, BinReaderExt, BinResult, NullWideString};
use num_traits::FromPrimitive;

use crate::error::{NettraceError, Result};
use crate::helpers::{read_utf16_string, remaining, skip};
use crate::nettrace::EventSchema;

use super::enums::{CoreClrMethodFlags, GcAllocationKind};

pub const DOTNET_RUNTIME_PROVIDER: &str = "Microsoft-Windows-DotNETRuntime";
pub const DOTNET_RUNDOWN_PROVIDER: &str = "Microsoft-Windows-DotNETRuntimeRundown";
pub const SAMPLE_PROFILER_PROVIDER: &str = "Microsoft-DotNETCore-SampleProfiler";

pub const GC_ALLOCATION_TICK_ID: u32 = 10;
pub const METHOD_LOAD_VERBOSE_ID: u32 = 143;
pub const METHOD_JITTING_STARTED_ID: u32 = 145;
pub const METHOD_DC_END_VERBOSE_ID: u32 = 144;

#[binrw::parser(reader, endian)]
fn parse_null_wide_string() -> BinResult<String> {
    let result = NullWideString::read_options(reader, endian, ())?;
    Ok(String::from_utf16_lossy(&result.0))
}

/// GCAllocationTick. The event has four versions with additive fields, so
/// the payload is parsed by what is actually present rather than by the
/// declared version: the 64-bit amount and the type id only exist when
/// enough bytes remain.
#[derive(Debug, Clone)]
pub struct AllocationTickEvent {
    pub allocation_amount: u64,
    pub allocation_kind: Option<GcAllocationKind>,
    pub raw_allocation_kind: u32,
    pub clr_instance_id: u16,
    pub type_name: String,
}

impl AllocationTickEvent {
    pub fn parse(payload: &[u8], pointer_size: u32) -> Result<Self> {
        Self::parse_inner(payload, pointer_size).map_err(|err| NettraceError::MalformedPayload {
            event: "GCAllocationTick",
            message: err.to_string(),
        })
    }

    fn parse_inner(payload: &[u8], pointer_size: u32) -> BinResult<Self> {
        let mut reader = Cursor::new(payload);
        let amount32: u32 = reader.read_le()?;
        let raw_allocation_kind: u32 = reader.read_le()?;
        let clr_instance_id: u16 = reader.read_le()?;

        let mut allocation_amount = u64::from(amount32);
        if remaining(&reader) >= 8 {
            allocation_amount = reader.read_le()?;
        }
        if remaining(&reader) >= pointer_size as usize {
            skip(&mut reader, u64::from(pointer_size))?;
        }
        let type_name = read_utf16_string(&mut reader)?;
        let type_name = if type_name.is_empty() {
            "<unknown>".to_string()
        } else {
            type_name
        };

        Ok(AllocationTickEvent {
            allocation_amount,
            allocation_kind: GcAllocationKind::from_u32(raw_allocation_kind),
            raw_allocation_kind,
            clr_instance_id,
            type_name,
        })
    }
}

/// MethodLoadVerbose / MethodDCEndVerbose. Both advertise the JIT-compiled
/// address range of a method together with its names; the trailing CLR
/// instance id is not read.
#[derive(BinRead, Debug, Clone)]
#[br(little)]
pub struct MethodLoadEvent {
    pub method_id: u64,
    pub module_id: u64,
    pub method_start_address: u64,
    pub method_size: u32,
    pub method_token: u32,
    pub method_flags: u32,
    #[br(parse_with = parse_null_wide_string)]
    pub method_namespace: String,
    #[br(parse_with = parse_null_wide_string)]
    pub method_name: String,
    #[br(parse_with = parse_null_wide_string)]
    pub method_signature: String,
}

impl MethodLoadEvent {
    pub fn flags(&self) -> CoreClrMethodFlags {
        CoreClrMethodFlags::from_bits_retain(self.method_flags)
    }
}

/// MethodJittingStarted. Carries names but no address range, so it only
/// matters for methods nothing else described.
#[derive(BinRead, Debug, Clone)]
#[br(little)]
pub struct MethodJittingStartedEvent {
    pub method_id: u64,
    pub module_id: u64,
    pub method_token: u32,
    pub il_size: u32,
    #[br(parse_with = parse_null_wide_string)]
    pub method_namespace: String,
    #[br(parse_with = parse_null_wide_string)]
    pub method_name: String,
    #[br(parse_with = parse_null_wide_string)]
    pub method_signature: String,
}

#[derive(Debug, Clone)]
pub enum CoreClrEvent {
    GcAllocationTick(AllocationTickEvent),
    MethodLoad(MethodLoadEvent),
    MethodDCEnd(MethodLoadEvent),
    MethodJittingStarted(MethodJittingStartedEvent),
    SampleProfilerTick,
}

/// Matches an event against the recognized provider/event-id pairs and
/// parses its payload. `Ok(None)` means the event is valid but not one the
/// model aggregates beyond counters.
pub fn decode_coreclr_event(
    schema: &EventSchema,
    payload: &[u8],
    pointer_size: u32,
) -> Result<Option<CoreClrEvent>> {
    match schema.provider_name.as_str() {
        DOTNET_RUNTIME_PROVIDER => match schema.event_id {
            GC_ALLOCATION_TICK_ID => AllocationTickEvent::parse(payload, pointer_size)
                .map(|event| Some(CoreClrEvent::GcAllocationTick(event))),
            METHOD_LOAD_VERBOSE_ID => read_method_load(payload, "MethodLoadVerbose")
                .map(|event| Some(CoreClrEvent::MethodLoad(event))),
            METHOD_JITTING_STARTED_ID => MethodJittingStartedEvent::read(&mut Cursor::new(payload))
                .map(|event| Some(CoreClrEvent::MethodJittingStarted(event)))
                .map_err(|err| NettraceError::MalformedPayload {
                    event: "MethodJittingStarted",
                    message: err.to_string(),
                }),
            _ => Ok(None),
        },
        DOTNET_RUNDOWN_PROVIDER => match schema.event_id {
            METHOD_DC_END_VERBOSE_ID => read_method_load(payload, "MethodDCEndVerbose")
                .map(|event| Some(CoreClrEvent::MethodDCEnd(event))),
            _ => Ok(None),
        },
        SAMPLE_PROFILER_PROVIDER => Ok(Some(CoreClrEvent::SampleProfilerTick)),
        _ => Ok(None),
    }
}

fn read_method_load(payload: &[u8], event: &'static str) -> Result<MethodLoadEvent> {
    MethodLoadEvent::read(&mut Cursor::new(payload)).map_err(|err| {
        NettraceError::MalformedPayload {
            event,
            message: err.to_string(),
        }
    })
}
