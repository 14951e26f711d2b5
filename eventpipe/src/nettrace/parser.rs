//! Container driver and event stream decoding.
//!
//! The driver walks the tagged object stream of a fully buffered trace,
//! maintains the in-band type registry, and decodes the five known block
//! kinds. Errors inside a block abort that block only: the driver records a
//! message and resumes at the next tag, so a truncated or corrupt section
//! costs its own data and nothing else.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use binrw::{BinRead, BinReaderExt};

use crate::error::{NettraceError, Result};
use crate::helpers::{
    align_up_4, peek_u8, read_utf16_string, read_varuint32, read_varuint64, remaining, skip,
};
use crate::nettrace::{
    BlockHeader, EventHeader, EventSchema, FieldSchema, LengthPrefixedString, MetadataTypeCode,
    TagDialect, TraceInfo, TypeRecord, UncompressedEventHeader, TAG_BEGIN_OBJECT,
    TAG_BEGIN_PRIVATE_OBJECT, TAG_NULL_REFERENCE,
};

const MAGIC: &[u8; 8] = b"Nettrace";
const SERIALIZATION_BANNER: &str = "!FastSerialization.1";

/// Hard cap on the object walk, as a defense against pathological inputs.
const MAX_OBJECTS: u64 = 10_000_000;

/// One decoded event. The payload borrows from the input buffer.
#[derive(Debug, Clone)]
pub struct EventRecord<'a> {
    pub header: EventHeader,
    pub payload: &'a [u8],
}

/// Everything the container-level walk accumulates besides events.
#[derive(Debug, Default)]
pub struct ParsedTables {
    pub trace_info: Option<TraceInfo>,
    pub schemas: HashMap<u32, EventSchema>,
    pub stacks: HashMap<u32, Vec<u64>>,
    pub errors: Vec<String>,
}

enum WalkStep {
    Continue,
    Done,
}

/// Pull parser over a buffered nettrace byte stream.
///
/// `next_event` yields the events of every `EventBlock` in file order;
/// metadata, stack and sequence-point blocks are folded into the parser's
/// tables as they are encountered, so an event's schema and stack are
/// resolvable the moment the event is returned.
pub struct EventPipeParser<'a> {
    data: &'a [u8],
    reader: Cursor<&'a [u8]>,
    dialect: Option<TagDialect>,
    types: Vec<TypeRecord>,
    schemas: HashMap<u32, EventSchema>,
    stacks: HashMap<u32, Vec<u64>>,
    trace_info: Option<TraceInfo>,
    errors: Vec<String>,
    events: Option<EventIter<'a>>,
    objects_walked: u64,
    finished: bool,
}

impl<'a> EventPipeParser<'a> {
    /// Validates the magic and the serialization banner. These two checks
    /// are the only fatal ones; everything after construction degrades to
    /// error-list entries.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let mut reader = Cursor::new(data);
        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .map_err(|_| NettraceError::InvalidMagic)?;
        if &magic != MAGIC {
            return Err(NettraceError::InvalidMagic);
        }

        let banner = LengthPrefixedString::read(&mut reader).map_err(|_| {
            NettraceError::InvalidSerializationHeader("missing header string".to_string())
        })?;
        let banner = banner.to_string_lossy();
        if !banner.starts_with(SERIALIZATION_BANNER) {
            return Err(NettraceError::InvalidSerializationHeader(
                banner.into_owned(),
            ));
        }

        Ok(EventPipeParser {
            data,
            reader,
            dialect: None,
            types: Vec::new(),
            schemas: HashMap::new(),
            stacks: HashMap::new(),
            trace_info: None,
            errors: Vec::new(),
            events: None,
            objects_walked: 0,
            finished: false,
        })
    }

    pub fn trace_info(&self) -> Option<TraceInfo> {
        self.trace_info
    }

    pub fn schema(&self, metadata_id: u32) -> Option<&EventSchema> {
        self.schemas.get(&metadata_id)
    }

    pub fn stack(&self, stack_id: u32) -> Option<&[u64]> {
        self.stacks.get(&stack_id).map(Vec::as_slice)
    }

    /// Stack-address width for this trace; 8 until a `Trace` object says
    /// otherwise.
    pub fn pointer_size(&self) -> u32 {
        self.trace_info.map(|info| info.pointer_size).unwrap_or(8)
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// The next event in file order, or `None` once the stream is
    /// exhausted. Decoding problems never end the stream early; they are
    /// recorded and skipped.
    pub fn next_event(&mut self) -> Option<EventRecord<'a>> {
        loop {
            if let Some(iter) = self.events.as_mut() {
                match iter.next_record() {
                    Ok(Some(record)) => return Some(record),
                    Ok(None) => {
                        self.events = None;
                        self.finish_object();
                    }
                    Err(err) => {
                        self.errors.push(format!("EventBlock: {err}"));
                        log::warn!("abandoning event block: {err}");
                        self.events = None;
                        self.finish_object();
                    }
                }
                continue;
            }

            if self.finished {
                return None;
            }
            match self.walk_one_object() {
                WalkStep::Continue => {}
                WalkStep::Done => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Consumes the parser once the event stream has been drained.
    pub fn into_tables(mut self) -> ParsedTables {
        while self.next_event().is_some() {}
        ParsedTables {
            trace_info: self.trace_info,
            schemas: self.schemas,
            stacks: self.stacks,
            errors: self.errors,
        }
    }

    fn walk_one_object(&mut self) -> WalkStep {
        if self.objects_walked >= MAX_OBJECTS {
            self.errors
                .push(format!("container: object budget of {MAX_OBJECTS} exhausted"));
            return WalkStep::Done;
        }
        self.objects_walked += 1;

        if remaining(&self.reader) == 0 {
            return WalkStep::Done;
        }
        let tag = match self.reader.read_le::<u8>() {
            Ok(tag) => tag,
            Err(_) => return WalkStep::Done,
        };

        match tag {
            TAG_NULL_REFERENCE => WalkStep::Continue,
            tag if self.is_end_object(tag) => WalkStep::Continue,
            TAG_BEGIN_OBJECT | TAG_BEGIN_PRIVATE_OBJECT => {
                if let Err(err) = self.read_object() {
                    self.errors.push(format!("container: {err}"));
                    log::warn!("recovering object walk: {err}");
                    self.recover_to_next_tag();
                }
                WalkStep::Continue
            }
            other => {
                log::debug!("unexpected tag {other} in object stream, scanning forward");
                self.recover_to_next_tag();
                WalkStep::Continue
            }
        }
    }

    fn is_end_object(&self, tag: u8) -> bool {
        match self.dialect {
            Some(dialect) => tag == dialect.end_object(),
            // Not locked yet: either numbering is plausible.
            None => tag == 2 || tag == 6,
        }
    }

    /// Parses one object whose begin tag has already been consumed.
    fn read_object(&mut self) -> Result<()> {
        let type_index = self.read_type_reference()?;
        let type_name = self
            .types
            .get(type_index)
            .ok_or(NettraceError::UnknownTypeIndex(type_index as u32))?
            .name
            .clone();
        log::trace!(
            "object {} of type {:?} at offset {}",
            self.objects_walked,
            type_name,
            self.reader.position()
        );

        match type_name.as_str() {
            "Trace" => {
                let info = TraceInfo::read(&mut self.reader)?;
                log::debug!("trace info: {info:?}");
                self.trace_info = Some(info);
                self.finish_object();
            }
            "MetadataBlock" => {
                let content = self.read_block_content("MetadataBlock")?;
                self.decode_metadata_block(content);
                self.finish_object();
            }
            "EventBlock" => {
                let content = self.read_block_content("EventBlock")?;
                match EventIter::new(content) {
                    Ok(iter) => self.events = Some(iter),
                    // The closing tag is consumed when the iterator drains,
                    // so on failure consume it here.
                    Err(err) => {
                        self.errors.push(format!("EventBlock: {err}"));
                        self.finish_object();
                    }
                }
            }
            "StackBlock" => {
                let content = self.read_block_content("StackBlock")?;
                self.decode_stack_block(content);
                self.finish_object();
            }
            "SPBlock" => {
                let content = self.read_block_content("SPBlock")?;
                self.decode_sequence_point_block(content);
                self.finish_object();
            }
            other => {
                log::debug!("skipping object of unknown type {other:?}");
                self.recover_to_next_tag();
            }
        }
        Ok(())
    }

    /// The type reference that prefixes every object: either a nested type
    /// definition, a legacy direct definition, or a varint back-reference
    /// into the registry.
    fn read_type_reference(&mut self) -> Result<usize> {
        let next = peek_u8(&mut self.reader)?;
        if next == TAG_BEGIN_PRIVATE_OBJECT {
            self.reader.read_le::<u8>()?;
            let inner = peek_u8(&mut self.reader)?;
            let index = if inner == TAG_NULL_REFERENCE {
                self.reader.read_le::<u8>()?;
                self.read_type_definition()?
            } else {
                read_varuint32(&mut self.reader)? as usize
            };
            self.consume_type_end_tag()?;
            Ok(index)
        } else if next == TAG_NULL_REFERENCE {
            self.reader.read_le::<u8>()?;
            let index = self.read_type_definition()?;
            self.consume_type_end_tag()?;
            Ok(index)
        } else {
            Ok(read_varuint32(&mut self.reader)? as usize)
        }
    }

    fn read_type_definition(&mut self) -> Result<usize> {
        let version = self.reader.read_le::<u32>()?;
        let min_reader_version = self.reader.read_le::<u32>()?;
        let name = LengthPrefixedString::read(&mut self.reader)?;
        let record = TypeRecord {
            version,
            min_reader_version,
            name: name.to_string_lossy().into_owned(),
        };
        log::trace!("type {} defined: {record:?}", self.types.len());
        self.types.push(record);
        Ok(self.types.len() - 1)
    }

    /// Consumes the tag closing a type-reference object. The first one seen
    /// locks the tag dialect for the rest of the stream.
    fn consume_type_end_tag(&mut self) -> Result<()> {
        let tag = self.reader.read_le::<u8>()?;
        match self.dialect {
            Some(dialect) if tag == dialect.end_object() => Ok(()),
            Some(_) => Err(NettraceError::MalformedBlock {
                kind: "type reference",
                message: format!("expected EndObject, found tag {tag}"),
            }),
            None => {
                let dialect = match tag {
                    2 => TagDialect::Legacy,
                    6 => TagDialect::Modern,
                    other => {
                        return Err(NettraceError::MalformedBlock {
                            kind: "type reference",
                            message: format!("tag {other} closes the first type object"),
                        })
                    }
                };
                log::debug!("tag dialect locked: {dialect:?}");
                self.dialect = Some(dialect);
                Ok(())
            }
        }
    }

    /// Block framing shared by all block kinds: a 32-bit size, padding up to
    /// the next 4-aligned file offset, then the content itself.
    fn read_block_content(&mut self, kind: &'static str) -> Result<&'a [u8]> {
        let size = self.reader.read_le::<i32>()?;
        if size < 0 {
            return Err(NettraceError::MalformedBlock {
                kind,
                message: format!("negative block size {size}"),
            });
        }
        align_up_4(&mut self.reader, 0)?;
        let size = size as usize;
        let start = self.reader.position() as usize;
        if start > self.data.len() {
            return Err(NettraceError::UnexpectedEnd);
        }
        let available = self.data.len() - start;
        if size > available {
            return Err(NettraceError::MalformedBlock {
                kind,
                message: format!("block size {size} exceeds the {available} remaining bytes"),
            });
        }
        self.reader.set_position((start + size) as u64);
        Ok(&self.data[start..start + size])
    }

    /// Consumes the EndObject tag that closes the current object; scans
    /// forward if the stream disagrees.
    fn finish_object(&mut self) {
        match peek_u8(&mut self.reader) {
            Ok(tag) if self.is_end_object(tag) => {
                let _ = self.reader.read_le::<u8>();
            }
            Ok(tag) => {
                log::debug!("expected EndObject, found tag {tag}; scanning forward");
                self.recover_to_next_tag();
            }
            Err(_) => {}
        }
    }

    /// Skips forward to the next EndObject (consumed) or BeginPrivateObject
    /// (left for the walk). Used for unknown object types and after any
    /// recovered error.
    fn recover_to_next_tag(&mut self) {
        let end_object = self
            .dialect
            .map(TagDialect::end_object)
            .unwrap_or(TagDialect::Modern.end_object());
        loop {
            let position = self.reader.position() as usize;
            let Some(&byte) = self.data.get(position) else {
                return;
            };
            if byte == end_object {
                self.reader.set_position(position as u64 + 1);
                return;
            }
            if byte == TAG_BEGIN_PRIVATE_OBJECT {
                return;
            }
            self.reader.set_position(position as u64 + 1);
        }
    }

    fn decode_metadata_block(&mut self, content: &'a [u8]) {
        let mut iter = match EventIter::new(content) {
            Ok(iter) => iter,
            Err(err) => {
                self.errors.push(format!("MetadataBlock: {err}"));
                return;
            }
        };
        loop {
            match iter.next_record() {
                Ok(Some(record)) => match parse_metadata_descriptor(record.payload) {
                    Ok(schema) => {
                        log::trace!(
                            "metadata {}: {}:{} {:?}",
                            schema.metadata_id,
                            schema.provider_name,
                            schema.event_id,
                            schema.event_name
                        );
                        self.schemas.insert(schema.metadata_id, schema);
                    }
                    // A bad descriptor skips that pseudo-event only.
                    Err(err) => self.errors.push(format!("metadata descriptor: {err}")),
                },
                Ok(None) => break,
                Err(err) => {
                    self.errors.push(format!("MetadataBlock: {err}"));
                    break;
                }
            }
        }
    }

    fn decode_stack_block(&mut self, content: &[u8]) {
        let mut reader = Cursor::new(content);
        let (first_id, count) = match read_stack_block_prologue(&mut reader) {
            Ok(prologue) => prologue,
            Err(err) => {
                self.errors.push(format!("StackBlock: {err}"));
                return;
            }
        };
        let pointer_size = self.pointer_size();
        if pointer_size != 4 && pointer_size != 8 {
            self.errors.push(format!(
                "StackBlock: unsupported pointer size {pointer_size}, entries dropped"
            ));
            return;
        }
        log::trace!("stack block: first id {first_id}, {count} entries");

        for index in 0..count {
            let stack_id = first_id.wrapping_add(index);
            let size = match reader.read_le::<u32>() {
                Ok(size) => size,
                Err(err) => {
                    self.errors
                        .push(format!("StackBlock: {}", NettraceError::from(err)));
                    return;
                }
            };
            if size == 0 {
                break;
            }
            let size = size as usize;
            if size > remaining(&reader) {
                self.errors.push(format!(
                    "StackBlock: stack {stack_id} declares {size} bytes past the block end"
                ));
                return;
            }
            if size % pointer_size as usize != 0 {
                self.errors.push(format!(
                    "StackBlock: stack {stack_id} size {size} is not a multiple of {pointer_size}"
                ));
                let _ = skip(&mut reader, size as u64);
                continue;
            }
            let mut addresses = Vec::with_capacity(size / pointer_size as usize);
            for _ in 0..size / pointer_size as usize {
                let address = if pointer_size == 8 {
                    reader.read_le::<u64>()
                } else {
                    reader.read_le::<u32>().map(u64::from)
                };
                match address {
                    Ok(address) => addresses.push(address),
                    Err(err) => {
                        self.errors
                            .push(format!("StackBlock: {}", NettraceError::from(err)));
                        return;
                    }
                }
            }
            self.stacks.insert(stack_id, addresses);
        }
    }

    /// Sequence points carry per-thread sequence numbers for drop
    /// accounting. Nothing downstream consumes them; they are decoded for
    /// validation and logged.
    fn decode_sequence_point_block(&mut self, content: &[u8]) {
        let mut reader = Cursor::new(content);
        let result = (|| -> Result<(u64, u32)> {
            let timestamp = reader.read_le::<u64>()?;
            let thread_count = reader.read_le::<u32>()?;
            for _ in 0..thread_count {
                let _thread_id = reader.read_le::<u64>()?;
                let _sequence_number = reader.read_le::<u32>()?;
            }
            Ok((timestamp, thread_count))
        })();
        match result {
            Ok((timestamp, thread_count)) => {
                log::trace!("sequence point at {timestamp} covering {thread_count} threads");
            }
            Err(err) => self.errors.push(format!("SPBlock: {err}")),
        }
    }
}

fn read_stack_block_prologue(reader: &mut Cursor<&[u8]>) -> Result<(u32, u32)> {
    let first_id = reader.read_le::<u32>()?;
    let count = reader.read_le::<u32>()?;
    Ok((first_id, count))
}

/// Walks the events of one `EventBlock` or `MetadataBlock`. Carry state for
/// the compressed encoding starts zeroed at every block and is never shared
/// across blocks.
pub struct EventIter<'a> {
    data: &'a [u8],
    reader: Cursor<&'a [u8]>,
    compressed: bool,
    carry: EventHeader,
}

impl<'a> EventIter<'a> {
    pub fn new(content: &'a [u8]) -> Result<Self> {
        let mut reader = Cursor::new(content);
        let header = read_block_header(&mut reader)?;
        Ok(EventIter {
            data: content,
            reader,
            compressed: header.compressed_headers(),
            carry: EventHeader::default(),
        })
    }

    pub fn next_record(&mut self) -> Result<Option<EventRecord<'a>>> {
        if remaining(&self.reader) == 0 {
            return Ok(None);
        }
        let event_start = self.reader.position();
        let header = if self.compressed {
            self.read_compressed_header()?
        } else {
            EventHeader::from(UncompressedEventHeader::read(&mut self.reader)?)
        };

        let position = self.reader.position() as usize;
        if position > self.data.len() {
            return Err(NettraceError::UnexpectedEnd);
        }
        let payload_size = header.payload_size as usize;
        if payload_size > self.data.len() - position {
            return Err(NettraceError::MalformedEvent(format!(
                "payload size {payload_size} exceeds the block"
            )));
        }
        let payload = &self.data[position..position + payload_size];
        self.reader.set_position((position + payload_size) as u64);

        if !self.compressed {
            align_up_4(&mut self.reader, event_start)?;
        }

        self.carry = header.clone();
        Ok(Some(EventRecord { header, payload }))
    }

    /// Flag-driven varint encoding: each bit spells one header field out,
    /// everything else reuses the previous event's value. The timestamp is
    /// always a delta against the carry.
    fn read_compressed_header(&mut self) -> Result<EventHeader> {
        let reader = &mut self.reader;
        let flags: u8 = reader.read_le()?;
        let mut header = self.carry.clone();

        if flags & 0x01 != 0 {
            header.metadata_id = read_varuint32(reader)?;
        }
        if flags & 0x02 != 0 {
            let delta = read_varuint32(reader)?;
            header.sequence_number = self
                .carry
                .sequence_number
                .wrapping_add(delta)
                .wrapping_add(1);
            header.capture_thread_id = read_varuint64(reader)?;
            header.processor_number = read_varuint32(reader)?;
        } else if header.metadata_id != 0 {
            header.sequence_number = self.carry.sequence_number.wrapping_add(1);
        }
        if flags & 0x04 != 0 {
            header.thread_id = read_varuint64(reader)?;
        }
        if flags & 0x08 != 0 {
            header.stack_id = read_varuint32(reader)?;
        }
        header.timestamp = self.carry.timestamp.wrapping_add(read_varuint64(reader)?);
        if flags & 0x10 != 0 {
            skip(reader, 16)?;
        }
        if flags & 0x20 != 0 {
            skip(reader, 16)?;
        }
        header.is_sorted = flags & 0x40 != 0;
        if flags & 0x80 != 0 {
            header.payload_size = read_varuint32(reader)?;
        }

        Ok(header)
    }
}

/// The common block prologue: self-inclusive header size, flags, and (for
/// headers big enough to carry them) the min/max event timestamps.
fn read_block_header(reader: &mut Cursor<&[u8]>) -> Result<BlockHeader> {
    let size = reader.read_le::<u16>()?;
    let flags = reader.read_le::<u16>()?;
    let mut header = BlockHeader {
        size,
        flags,
        ..Default::default()
    };
    let mut consumed = 4u16;
    if size >= 20 {
        header.min_timestamp = reader.read_le::<u64>()?;
        header.max_timestamp = reader.read_le::<u64>()?;
        consumed = 20;
    }
    if size < consumed {
        return Err(NettraceError::MalformedBlock {
            kind: "block header",
            message: format!("header size {size} smaller than its fixed fields"),
        });
    }
    skip(reader, u64::from(size - consumed))?;
    Ok(header)
}

/// The payload of a metadata pseudo-event: an event-schema descriptor. The
/// metadata id in the payload is authoritative over the header-carried one.
fn parse_metadata_descriptor(payload: &[u8]) -> Result<EventSchema> {
    let mut reader = Cursor::new(payload);
    let metadata_id = reader.read_le::<u32>()?;
    let provider_name = read_utf16_string(&mut reader)?;
    let event_id = reader.read_le::<u32>()?;
    let event_name = read_utf16_string(&mut reader)?;
    let keywords = reader.read_le::<u64>()?;
    let version = reader.read_le::<u32>()?;
    let level = reader.read_le::<u32>()?;
    let field_count = reader.read_le::<u32>()?;
    let fields = parse_field_list(&mut reader, field_count)?;

    let mut schema = EventSchema {
        metadata_id,
        provider_name,
        event_id,
        event_name,
        keywords,
        version,
        level,
        opcode: None,
        fields,
    };
    parse_metadata_tail(&mut reader, &mut schema);
    Ok(schema)
}

fn parse_field_list(reader: &mut Cursor<&[u8]>, field_count: u32) -> Result<Vec<FieldSchema>> {
    // Each field needs at least a type code and a terminator.
    if field_count as usize > remaining(reader) / 6 {
        return Err(NettraceError::MalformedPayload {
            event: "metadata",
            message: format!("field count {field_count} exceeds the payload"),
        });
    }
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let type_code = MetadataTypeCode::read(reader)?;
        if type_code == MetadataTypeCode::Array {
            let _element_type = MetadataTypeCode::read(reader)?;
        }
        let name = read_utf16_string(reader)?;
        fields.push(FieldSchema { name, type_code });
    }
    Ok(fields)
}

/// Optional tagged sections after the field list: an opcode byte, or a V2
/// parameter list replacing an empty V1 one. Parsed best-effort; a schema
/// without them is still usable.
fn parse_metadata_tail(reader: &mut Cursor<&[u8]>, schema: &mut EventSchema) {
    const TAG_OPCODE: u8 = 1;
    const TAG_V2_PARAMS: u8 = 2;

    while remaining(reader) >= 5 {
        let Ok(_size) = reader.read_le::<u32>() else {
            return;
        };
        let Ok(tag) = reader.read_le::<u8>() else {
            return;
        };
        match tag {
            TAG_OPCODE => match reader.read_le::<u8>() {
                Ok(opcode) => schema.opcode = Some(opcode),
                Err(_) => return,
            },
            TAG_V2_PARAMS => {
                let Ok(field_count) = reader.read_le::<u32>() else {
                    return;
                };
                match parse_field_list(reader, field_count) {
                    Ok(fields) if schema.fields.is_empty() => schema.fields = fields,
                    Ok(_) | Err(_) => return,
                }
            }
            _ => return,
        }
    }
}
