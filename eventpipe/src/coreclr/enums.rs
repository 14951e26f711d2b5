use std::fmt::Display;

use bitflags::bitflags;
use num_derive::FromPrimitive;

/// Heap the allocation tick fired for.
#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq)]
pub enum GcAllocationKind {
    Small = 0,
    Large = 1,
    Pinned = 2,
}

impl Display for GcAllocationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GcAllocationKind::Small => f.write_str("Small"),
            GcAllocationKind::Large => f.write_str("Large"),
            GcAllocationKind::Pinned => f.write_str("Pinned"),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoreClrMethodFlags: u32 {
        const dynamic = 0x1;
        const generic = 0x2;
        const has_shared_generic_code = 0x4;
        const jitted = 0x8;
        const jit_helper = 0x10;
        const profiler_rejected_precompiled_code = 0x20;
        const ready_to_run_rejected_precompiled_code = 0x40;

        // next three bits are the tiered compilation level
        const opttier_bit0 = 0x80;
        const opttier_bit1 = 0x100;
        const opttier_bit2 = 0x200;

        // extent flags/value (hot/cold)
        const extent_bit_0 = 0x10000000; // 0x1 == cold, 0x0 = hot
        const extent_bit_1 = 0x20000000;
        const extent_bit_2 = 0x40000000;
        const extent_bit_3 = 0x80000000;

        const _ = !0;
    }
}
