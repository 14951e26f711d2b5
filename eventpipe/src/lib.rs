//! Reader for the .NET EventPipe trace file format ("nettrace").
//!
//! The format is a self-describing container: a tagged object stream whose
//! payloads are typed blocks (trace header, metadata, events, stacks,
//! sequence points). [`EventPipeParser`] walks a fully buffered trace and
//! yields events in file order while folding metadata and stack blocks into
//! lookup tables; the [`coreclr`] module decodes the payloads of the
//! well-known CLR events.
//!
//! Malformed sections never take the whole trace down: any error past the
//! magic and the serialization banner is recorded in an error list and
//! decoding resumes at the next object boundary.

mod error;
mod helpers;

pub mod coreclr;
pub mod nettrace;

pub use error::{NettraceError, Result};
pub use nettrace::parser::{EventIter, EventPipeParser, EventRecord, ParsedTables};
pub use nettrace::{
    BlockHeader, EventHeader, EventSchema, FieldSchema, MetadataTypeCode, TagDialect, TraceInfo,
    TraceTime, TypeRecord,
};
