//! Wire-format records of the nettrace container.
//!
//! https://github.com/microsoft/perfview/blob/main/src/TraceEvent/EventPipe/EventPipeFormat.md

use binrw::BinRead;

pub mod parser;

pub const TAG_NULL_REFERENCE: u8 = 1;
pub const TAG_BEGIN_OBJECT: u8 = 4;
pub const TAG_BEGIN_PRIVATE_OBJECT: u8 = 5;

/// The FastSerialization tag numbering changed across historical versions.
/// The closing tag of the first type-reference object decides which one a
/// stream uses; the driver locks the dialect there and keeps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagDialect {
    /// EndObject = 2, Blob = 6.
    Legacy,
    /// ObjectReference = 2, EndObject = 6, Blob = 14.
    Modern,
}

impl TagDialect {
    pub fn end_object(self) -> u8 {
        match self {
            TagDialect::Legacy => 2,
            TagDialect::Modern => 6,
        }
    }

    pub fn blob(self) -> u8 {
        match self {
            TagDialect::Legacy => 6,
            TagDialect::Modern => 14,
        }
    }
}

/// 32-bit length-prefixed ASCII string, used by the container for the
/// serialization banner and type names.
#[derive(BinRead)]
#[br(little)]
pub struct LengthPrefixedString {
    #[br(assert(length <= 0x0100_0000))]
    length: u32,

    #[br(count = length)]
    bytes: Vec<u8>,
}

impl LengthPrefixedString {
    pub fn to_string_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

impl std::fmt::Debug for LengthPrefixedString {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

/// An in-band type definition discovered during the object walk. The
/// registry is append-only and addressed by dense index.
#[derive(Debug, Clone)]
pub struct TypeRecord {
    pub version: u32,
    pub min_reader_version: u32,
    pub name: String,
}

/// Broken-down wall-clock sync time, interpreted as UTC.
#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[br(little)]
pub struct TraceTime {
    pub year: u16,
    pub month: u16,
    pub day_of_week: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub millisecond: u16,
}

/// The fixed 48-byte payload of the `Trace` object. The pointer size fixes
/// the width of all stack-address reads for the remainder of the trace.
#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct TraceInfo {
    pub sync_time_utc: TraceTime,
    pub sync_time_qpc: u64,
    pub qpc_frequency: u64,
    pub pointer_size: u32,
    pub process_id: u32,
    pub number_of_processors: u32,
    pub expected_cpu_sampling_rate: u32,
}

/// Common block prologue. Header sizes larger than what we consume are
/// skipped, which keeps larger future headers readable.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockHeader {
    pub size: u16,
    pub flags: u16,
    pub min_timestamp: u64,
    pub max_timestamp: u64,
}

impl BlockHeader {
    /// Bit 0 selects the compressed per-event header encoding.
    pub fn compressed_headers(&self) -> bool {
        self.flags & 1 != 0
    }
}

/// The fixed-layout per-event header used when a block does not carry
/// compressed headers. The top bit of `raw_metadata_id` is the sorted flag.
#[derive(BinRead, Debug, Default, Clone)]
#[br(little)]
pub struct UncompressedEventHeader {
    pub size: u32,
    pub raw_metadata_id: u32,
    pub sequence_number: u32,
    pub thread_id: u64,
    pub capture_thread_id: u64,
    pub processor_number: u32,
    pub stack_id: u32,
    pub timestamp: u64,
    pub activity_id: [u8; 16],
    pub related_activity_id: [u8; 16],
    pub payload_size: u32,
}

/// A fully resolved event header. Doubles as the per-block carry state for
/// the compressed encoding: fields a compressed event does not spell out
/// keep the previous event's values.
#[derive(Debug, Default, Clone)]
pub struct EventHeader {
    pub metadata_id: u32,
    pub sequence_number: u32,
    pub thread_id: u64,
    pub capture_thread_id: u64,
    pub processor_number: u32,
    pub stack_id: u32,
    pub timestamp: u64,
    pub is_sorted: bool,
    pub payload_size: u32,
}

impl From<UncompressedEventHeader> for EventHeader {
    fn from(raw: UncompressedEventHeader) -> Self {
        EventHeader {
            metadata_id: raw.raw_metadata_id & 0x7fff_ffff,
            sequence_number: raw.sequence_number,
            thread_id: raw.thread_id,
            capture_thread_id: raw.capture_thread_id,
            processor_number: raw.processor_number,
            stack_id: raw.stack_id,
            timestamp: raw.timestamp,
            is_sorted: raw.raw_metadata_id & 0x8000_0000 != 0,
            payload_size: raw.payload_size,
        }
    }
}

/// Field type codes used by metadata descriptors. The numbering follows the
/// CLR `TypeCode` values plus the EventPipe extensions.
#[derive(BinRead, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[br(little, repr = u32)]
pub enum MetadataTypeCode {
    #[default]
    Empty = 0,
    Object = 1,
    DBNull = 2,
    Boolean = 3,
    Char = 4,
    SByte = 5,
    Byte = 6,
    Int16 = 7,
    UInt16 = 8,
    Int32 = 9,
    UInt32 = 10,
    Int64 = 11,
    UInt64 = 12,
    Single = 13,
    Double = 14,
    Decimal = 15,
    DateTime = 16,
    Guid = 17,
    String = 18,
    Array = 19,
    VarUInt = 21,
    Utf8String = 23,
}

/// One declared payload field. Array fields carry a subordinate element
/// type code on the wire; it is consumed but not retained.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub name: String,
    pub type_code: MetadataTypeCode,
}

/// An event schema, decoded from a metadata pseudo-event. Events reference
/// their schema through the small metadata id carried in the event header.
#[derive(Debug, Clone)]
pub struct EventSchema {
    pub metadata_id: u32,
    pub provider_name: String,
    pub event_id: u32,
    pub event_name: String,
    pub keywords: u64,
    pub version: u32,
    pub level: u32,
    pub opcode: Option<u8>,
    pub fields: Vec<FieldSchema>,
}
