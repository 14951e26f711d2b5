//! JIT-compiled method records and the address→method resolver: a sorted
//! interval list over the advertised address ranges, searched by binary
//! search for the earliest interval containing a query address.

use std::collections::HashMap;

use eventpipe::coreclr::{CoreClrMethodFlags, MethodJittingStartedEvent, MethodLoadEvent};

#[derive(Debug, Clone)]
pub struct MethodRecord {
    pub method_id: u64,
    pub module_id: u64,
    pub start_address: u64,
    pub size: u32,
    pub token: u32,
    pub flags: u32,
    pub namespace: String,
    pub name: String,
    pub signature: String,
}

impl MethodRecord {
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    pub fn end_address(&self) -> u64 {
        self.start_address.saturating_add(u64::from(self.size))
    }

    pub fn method_flags(&self) -> CoreClrMethodFlags {
        CoreClrMethodFlags::from_bits_retain(self.flags)
    }
}

impl From<MethodLoadEvent> for MethodRecord {
    fn from(event: MethodLoadEvent) -> Self {
        MethodRecord {
            method_id: event.method_id,
            module_id: event.module_id,
            start_address: event.method_start_address,
            size: event.method_size,
            token: event.method_token,
            flags: event.method_flags,
            namespace: event.method_namespace,
            name: event.method_name,
            signature: event.method_signature,
        }
    }
}

impl From<MethodJittingStartedEvent> for MethodRecord {
    fn from(event: MethodJittingStartedEvent) -> Self {
        MethodRecord {
            method_id: event.method_id,
            module_id: event.module_id,
            start_address: 0,
            size: 0,
            token: event.method_token,
            flags: 0,
            namespace: event.method_namespace,
            name: event.method_name,
            signature: event.method_signature,
        }
    }
}

/// Method store, addressable by method id and (after `build_address_index`)
/// by instruction-pointer address.
#[derive(Debug, Default)]
pub struct MethodTable {
    by_id: HashMap<u64, MethodRecord>,
    /// (start, end, method id), sorted by start.
    intervals: Vec<(u64, u64, u64)>,
    /// Running maximum of `end` over the sorted prefix, so the lookup can
    /// stop scanning as soon as no earlier interval can still cover.
    prefix_max_end: Vec<u64>,
}

impl MethodTable {
    /// Load-verbose and DCEnd records carry the full picture and overwrite.
    pub fn insert(&mut self, record: MethodRecord) {
        self.by_id.insert(record.method_id, record);
    }

    /// Jitting-started records are weaker and never displace an existing one.
    pub fn insert_if_absent(&mut self, record: MethodRecord) {
        self.by_id.entry(record.method_id).or_insert(record);
    }

    pub fn get(&self, method_id: u64) -> Option<&MethodRecord> {
        self.by_id.get(&method_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MethodRecord> {
        self.by_id.values()
    }

    /// Builds the sorted interval index. Records without an address range
    /// (jitting-started only) are not addressable.
    pub fn build_address_index(&mut self) {
        self.intervals = self
            .by_id
            .values()
            .filter(|record| record.size > 0)
            .map(|record| (record.start_address, record.end_address(), record.method_id))
            .collect();
        self.intervals.sort_unstable();

        self.prefix_max_end = Vec::with_capacity(self.intervals.len());
        let mut max_end = 0u64;
        for &(_, end, _) in &self.intervals {
            max_end = max_end.max(end);
            self.prefix_max_end.push(max_end);
        }
    }

    /// The method whose interval contains `address`, earliest interval
    /// first when stale overlapping entries exist.
    pub fn lookup_address(&self, address: u64) -> Option<&MethodRecord> {
        let upper = self
            .intervals
            .partition_point(|&(start, _, _)| start <= address);
        let mut hit = None;
        for index in (0..upper).rev() {
            if self.prefix_max_end[index] <= address {
                break;
            }
            let (_, end, method_id) = self.intervals[index];
            if address < end {
                hit = Some(method_id);
            }
        }
        hit.and_then(|method_id| self.by_id.get(&method_id))
    }

    /// Resolves to the method's full name, or the literal hex address when
    /// no interval matches.
    pub fn resolve_name(&self, address: u64) -> String {
        match self.lookup_address(address) {
            Some(record) => record.full_name(),
            None => format!("{address:#x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(method_id: u64, start: u64, size: u32, name: &str) -> MethodRecord {
        MethodRecord {
            method_id,
            module_id: 1,
            start_address: start,
            size,
            token: 0,
            flags: 0,
            namespace: "NS".to_string(),
            name: name.to_string(),
            signature: String::new(),
        }
    }

    fn table(records: Vec<MethodRecord>) -> MethodTable {
        let mut table = MethodTable::default();
        for r in records {
            table.insert(r);
        }
        table.build_address_index();
        table
    }

    #[test]
    fn lookup_contains_start_excludes_end() {
        let table = table(vec![record(1, 0x1000, 0x100, "Foo")]);
        assert_eq!(table.lookup_address(0x1000).unwrap().name, "Foo");
        assert_eq!(table.lookup_address(0x10ff).unwrap().name, "Foo");
        assert!(table.lookup_address(0x1100).is_none());
        assert!(table.lookup_address(0xfff).is_none());
    }

    #[test]
    fn lookup_picks_the_right_neighbor() {
        let table = table(vec![
            record(1, 0x1000, 0x100, "Foo"),
            record(2, 0x2000, 0x80, "Bar"),
        ]);
        assert_eq!(table.lookup_address(0x1080).unwrap().name, "Foo");
        assert_eq!(table.lookup_address(0x2010).unwrap().name, "Bar");
        assert!(table.lookup_address(0x1800).is_none());
    }

    #[test]
    fn overlap_resolves_to_the_earliest_interval() {
        // A stale rundown entry spanning a recycled range, plus a newer
        // method inside it.
        let table = table(vec![
            record(1, 0x1000, 0x1000, "Stale"),
            record(2, 0x1200, 0x100, "Fresh"),
        ]);
        assert_eq!(table.lookup_address(0x1250).unwrap().name, "Stale");
        // Beyond the inner interval the outer one still matches.
        assert_eq!(table.lookup_address(0x1900).unwrap().name, "Stale");
    }

    #[test]
    fn resolve_name_falls_back_to_hex() {
        let table = table(vec![record(1, 0x1000, 0x100, "Foo")]);
        assert_eq!(table.resolve_name(0x1010), "NS.Foo");
        assert_eq!(table.resolve_name(0x2000), "0x2000");
    }

    #[test]
    fn jitting_started_never_displaces_load_verbose() {
        let mut table = MethodTable::default();
        table.insert(record(1, 0x1000, 0x100, "Loaded"));
        table.insert_if_absent(record(1, 0, 0, "Jitted"));
        assert_eq!(table.get(1).unwrap().name, "Loaded");
        table.insert_if_absent(record(2, 0, 0, "OnlyJitted"));
        assert_eq!(table.get(2).unwrap().name, "OnlyJitted");
    }

    #[test]
    fn records_without_a_range_are_not_addressable() {
        let table = table(vec![record(1, 0, 0, "NoRange")]);
        assert!(table.lookup_address(0).is_none());
    }
}
