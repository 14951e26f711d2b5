#![allow(dead_code)]
//! Synthesizes nettrace byte streams for the end-to-end tests: the magic
//! and banner, the tagged object stream with in-band type definitions and
//! back-references, and the five block kinds with their framing and
//! alignment rules.

pub fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn push_utf16(out: &mut Vec<u8>, text: &str) {
    for unit in text.encode_utf16() {
        push_u16(out, unit);
    }
    push_u16(out, 0);
}

pub fn push_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return;
        }
    }
}

const TAG_NULL_REFERENCE: u8 = 1;
const TAG_BEGIN_PRIVATE_OBJECT: u8 = 5;

pub struct TraceBuilder {
    buf: Vec<u8>,
    types: Vec<String>,
    end_tag: u8,
}

impl TraceBuilder {
    /// Modern tag numbering (EndObject = 6).
    pub fn new() -> Self {
        Self::with_end_tag(6)
    }

    /// Legacy tag numbering (EndObject = 2).
    pub fn legacy() -> Self {
        Self::with_end_tag(2)
    }

    fn with_end_tag(end_tag: u8) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"Nettrace");
        let banner = b"!FastSerialization.1";
        push_u32(&mut buf, banner.len() as u32);
        buf.extend_from_slice(banner);
        TraceBuilder {
            buf,
            types: Vec::new(),
            end_tag,
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(TAG_NULL_REFERENCE);
        self.buf
    }

    /// BeginPrivateObject plus a type reference: an in-band definition the
    /// first time a name appears, a varint back-reference afterwards.
    fn begin_object(&mut self, type_name: &str) {
        self.buf.push(TAG_BEGIN_PRIVATE_OBJECT);
        self.buf.push(TAG_BEGIN_PRIVATE_OBJECT);
        if let Some(index) = self.types.iter().position(|name| name == type_name) {
            push_varint(&mut self.buf, index as u64);
        } else {
            self.buf.push(TAG_NULL_REFERENCE);
            push_u32(&mut self.buf, 4); // type version
            push_u32(&mut self.buf, 4); // minimum reader version
            push_u32(&mut self.buf, type_name.len() as u32);
            self.buf.extend_from_slice(type_name.as_bytes());
            self.types.push(type_name.to_string());
        }
        self.buf.push(self.end_tag);
    }

    fn end_object(&mut self) {
        self.buf.push(self.end_tag);
    }

    /// The fixed 48-byte `Trace` payload, scenario-1 values by default
    /// except where overridden.
    pub fn trace_object(&mut self, pointer_size: u32, process_id: u32) {
        self.begin_object("Trace");
        for value in [2025u16, 11, 6, 29, 16, 26, 8, 0] {
            push_u16(&mut self.buf, value);
        }
        push_u64(&mut self.buf, 0); // sync time tick count
        push_u64(&mut self.buf, 10_000_000); // tick frequency
        push_u32(&mut self.buf, pointer_size);
        push_u32(&mut self.buf, process_id);
        push_u32(&mut self.buf, 8); // processor count
        push_u32(&mut self.buf, 1); // cpu sampling rate
        self.end_object();
    }

    /// Block framing: 32-bit size, padding up to the next 4-aligned file
    /// offset, then the content.
    pub fn block(&mut self, kind: &str, content: &[u8]) {
        self.begin_object(kind);
        push_u32(&mut self.buf, content.len() as u32);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self.buf.extend_from_slice(content);
        self.end_object();
    }

    /// A block whose declared size runs past the end of the stream; only
    /// `actual` content bytes follow.
    pub fn truncated_block(&mut self, kind: &str, declared: u32, actual: &[u8]) {
        self.begin_object(kind);
        push_u32(&mut self.buf, declared);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self.buf.extend_from_slice(actual);
        self.end_object();
    }

    /// An object of a type the reader does not know, with an opaque payload.
    pub fn unknown_object(&mut self, type_name: &str, payload_len: usize) {
        self.begin_object(type_name);
        self.buf.extend(std::iter::repeat(0xaa).take(payload_len));
        self.end_object();
    }
}

/// Common block prologue with the given flags (bit 0 = compressed headers).
pub fn block_header(flags: u16) -> Vec<u8> {
    let mut out = Vec::new();
    push_u16(&mut out, 20);
    push_u16(&mut out, flags);
    push_u64(&mut out, 0); // min timestamp
    push_u64(&mut out, 0); // max timestamp
    out
}

/// One compressed event spelling out metadata id, stack id and payload
/// size, with the given timestamp delta.
pub fn compressed_event(metadata_id: u32, stack_id: u32, timestamp_delta: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(0x01 | 0x08 | 0x80);
    push_varint(&mut out, u64::from(metadata_id));
    push_varint(&mut out, u64::from(stack_id));
    push_varint(&mut out, timestamp_delta);
    push_varint(&mut out, payload.len() as u64);
    out.extend_from_slice(payload);
    out
}

/// A metadata pseudo-event (compressed header) whose payload is a
/// field-less event-schema descriptor.
pub fn metadata_block_content(entries: &[(u32, &str, u32, &str)]) -> Vec<u8> {
    let mut content = block_header(1);
    for &(metadata_id, provider, event_id, event_name) in entries {
        let mut descriptor = Vec::new();
        push_u32(&mut descriptor, metadata_id);
        push_utf16(&mut descriptor, provider);
        push_u32(&mut descriptor, event_id);
        push_utf16(&mut descriptor, event_name);
        push_u64(&mut descriptor, 0); // keywords
        push_u32(&mut descriptor, 4); // version
        push_u32(&mut descriptor, 4); // level
        push_u32(&mut descriptor, 0); // field count

        content.push(0x80);
        push_varint(&mut content, 0); // timestamp delta
        push_varint(&mut content, descriptor.len() as u64);
        content.extend_from_slice(&descriptor);
    }
    content
}

/// Stack block content with 64-bit addresses, ids starting at `first_id`.
pub fn stack_block_content(first_id: u32, stacks: &[&[u64]]) -> Vec<u8> {
    let mut content = Vec::new();
    push_u32(&mut content, first_id);
    push_u32(&mut content, stacks.len() as u32);
    for stack in stacks {
        push_u32(&mut content, (stack.len() * 8) as u32);
        for &address in *stack {
            push_u64(&mut content, address);
        }
    }
    content
}

/// GCAllocationTick payload, version-2 shape.
pub fn allocation_tick_payload(amount64: u64, type_name: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    push_u32(&mut payload, 64); // 32-bit amount, overridden below
    push_u32(&mut payload, 0); // kind: Small
    push_u16(&mut payload, 0); // clr instance id
    push_u64(&mut payload, amount64);
    push_u64(&mut payload, 0x7000_1000); // type id, skipped
    push_utf16(&mut payload, type_name);
    push_u32(&mut payload, 0); // heap index
    payload
}

/// MethodLoadVerbose payload.
pub fn method_load_payload(start_address: u64, size: u32, namespace: &str, name: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    push_u64(&mut payload, start_address); // method id, reuse the address
    push_u64(&mut payload, 0x20); // module id
    push_u64(&mut payload, start_address);
    push_u32(&mut payload, size);
    push_u32(&mut payload, 0x0600_0001); // token
    push_u32(&mut payload, 0x8); // flags: jitted
    push_utf16(&mut payload, namespace);
    push_utf16(&mut payload, name);
    push_utf16(&mut payload, "void ()");
    push_u16(&mut payload, 0); // clr instance id
    payload
}
