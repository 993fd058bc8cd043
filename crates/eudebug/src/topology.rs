//! Device shape and thread addressing.
//!
//! Two coordinate systems are in use. A [`ThreadPattern`] is what the debugger passes in: slices
//! are numbered across the whole device and any field may be [`WILDCARD`]. A [`ThreadId`] names
//! exactly one hardware thread slot and carries the tile plus the tile-local slice.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DebugError, Result};

/// Matches every value of a [`ThreadPattern`] field.
pub const WILDCARD: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadPattern {
    pub slice: u32,
    pub subslice: u32,
    pub eu: u32,
    pub thread: u32,
}

impl ThreadPattern {
    pub const ALL: ThreadPattern = ThreadPattern::new(WILDCARD, WILDCARD, WILDCARD, WILDCARD);

    pub const fn new(slice: u32, subslice: u32, eu: u32, thread: u32) -> Self {
        Self {
            slice,
            subslice,
            eu,
            thread,
        }
    }

    fn fields(&self) -> [u32; 4] {
        [self.slice, self.subslice, self.eu, self.thread]
    }

    pub fn is_all(&self) -> bool {
        self.fields().iter().all(|f| *f == WILDCARD)
    }

    pub fn is_single(&self) -> bool {
        self.fields().iter().all(|f| *f != WILDCARD)
    }

    /// Every thread matched by `other` is also matched by `self`.
    pub fn contains(&self, other: &ThreadPattern) -> bool {
        self.fields()
            .iter()
            .zip(other.fields())
            .all(|(mine, theirs)| *mine == WILDCARD || *mine == theirs)
    }

    /// Some thread is matched by both patterns.
    pub fn overlaps(&self, other: &ThreadPattern) -> bool {
        self.fields()
            .iter()
            .zip(other.fields())
            .all(|(mine, theirs)| *mine == WILDCARD || theirs == WILDCARD || *mine == theirs)
    }
}

impl fmt::Display for ThreadPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = |v: u32| {
            if v == WILDCARD {
                "*".to_string()
            } else {
                v.to_string()
            }
        };
        write!(
            f,
            "{}.{}.{}.{}",
            field(self.slice),
            field(self.subslice),
            field(self.eu),
            field(self.thread)
        )
    }
}

/// One hardware thread slot. `slice` is local to `tile`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId {
    pub tile: u32,
    pub slice: u32,
    pub subslice: u32,
    pub eu: u32,
    pub thread: u32,
}

impl ThreadId {
    pub const fn new(tile: u32, slice: u32, subslice: u32, eu: u32, thread: u32) -> Self {
        Self {
            tile,
            slice,
            subslice,
            eu,
            thread,
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tile{}/{}.{}.{}.{}",
            self.tile, self.slice, self.subslice, self.eu, self.thread
        )
    }
}

/// Per-tile thread topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topology {
    pub slices_per_tile: u32,
    pub subslices_per_slice: u32,
    pub eus_per_subslice: u32,
    pub threads_per_eu: u32,
    /// Bit `n` set: slice `n` of every tile is fused off.
    pub disabled_slices: u64,
    /// Bit `n` set: subslice `n` of every slice is fused off.
    pub disabled_subslices: u64,
}

impl Topology {
    pub const fn new(slices: u32, subslices: u32, eus: u32, threads: u32) -> Self {
        Self {
            slices_per_tile: slices,
            subslices_per_slice: subslices,
            eus_per_subslice: eus,
            threads_per_eu: threads,
            disabled_slices: 0,
            disabled_subslices: 0,
        }
    }

    pub fn is_enabled(&self, slice: u32, subslice: u32) -> bool {
        let off = |mask: u64, bit: u32| bit < 64 && mask & (1u64 << bit) != 0;
        !off(self.disabled_slices, slice) && !off(self.disabled_subslices, subslice)
    }
}

/// Static description of the debugged device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub tiles: u32,
    pub topology: Topology,
    /// Layouts before the SIP command channel need a resume bit written into the thread state.
    pub resume_wa_required: bool,
    /// Scratch space is described by a render-surface-state record rather than a plain base.
    pub scratch_via_surface_state: bool,
    /// Hardware threads per EU the scratch allocator sized for.
    pub thread_eu_ratio_for_scratch: u32,
}

impl DeviceInfo {
    pub fn new(tiles: u32, topology: Topology) -> Self {
        Self {
            tiles,
            topology,
            resume_wa_required: false,
            scratch_via_surface_state: false,
            thread_eu_ratio_for_scratch: topology.threads_per_eu,
        }
    }

    pub fn total_slices(&self) -> u32 {
        self.tiles * self.topology.slices_per_tile
    }

    /// Thread slots across all tiles, disabled subslices included.
    pub fn total_threads(&self) -> u64 {
        let topo = &self.topology;
        u64::from(self.total_slices())
            * u64::from(topo.subslices_per_slice)
            * u64::from(topo.eus_per_subslice)
            * u64::from(topo.threads_per_eu)
    }

    /// Device-wide slice index of a thread, as used in FIFO nodes and slot addressing.
    pub fn global_slice(&self, id: &ThreadId) -> u32 {
        id.tile * self.topology.slices_per_tile + id.slice
    }

    pub fn to_api(&self, id: &ThreadId) -> ThreadPattern {
        ThreadPattern::new(self.global_slice(id), id.subslice, id.eu, id.thread)
    }

    /// Converts device-wide coordinates, returning `None` for slots that do not exist.
    pub fn from_global(&self, slice: u32, subslice: u32, eu: u32, thread: u32) -> Option<ThreadId> {
        let topo = &self.topology;
        if slice >= self.total_slices()
            || subslice >= topo.subslices_per_slice
            || eu >= topo.eus_per_subslice
            || thread >= topo.threads_per_eu
        {
            return None;
        }
        let local = slice % topo.slices_per_tile;
        if !topo.is_enabled(local, subslice) {
            return None;
        }
        Some(ThreadId::new(
            slice / topo.slices_per_tile,
            local,
            subslice,
            eu,
            thread,
        ))
    }

    pub fn to_physical(&self, pattern: &ThreadPattern) -> Result<ThreadId> {
        if !pattern.is_single() {
            return Err(DebugError::InvalidArgument("thread pattern must name one thread"));
        }
        self.from_global(pattern.slice, pattern.subslice, pattern.eu, pattern.thread)
            .ok_or(DebugError::InvalidArgument("thread is outside the device topology"))
    }

    /// Rejects patterns with a non-wildcard field outside the topology.
    pub fn validate(&self, pattern: &ThreadPattern) -> Result<()> {
        let topo = &self.topology;
        let in_range = |v: u32, max: u32| v == WILDCARD || v < max;
        if in_range(pattern.slice, self.total_slices())
            && in_range(pattern.subslice, topo.subslices_per_slice)
            && in_range(pattern.eu, topo.eus_per_subslice)
            && in_range(pattern.thread, topo.threads_per_eu)
        {
            Ok(())
        } else {
            Err(DebugError::InvalidArgument("thread is outside the device topology"))
        }
    }

    /// Tiles a pattern can touch.
    pub fn tiles_of(&self, pattern: &ThreadPattern) -> Vec<u32> {
        if pattern.slice == WILDCARD {
            (0..self.tiles).collect()
        } else {
            vec![pattern.slice / self.topology.slices_per_tile]
        }
    }

    /// Enabled threads of one tile matched by `pattern`, in slot order.
    pub fn threads_in_tile(&self, tile: u32, pattern: &ThreadPattern) -> Vec<ThreadId> {
        let topo = &self.topology;
        let mut out = Vec::new();
        for slice in 0..topo.slices_per_tile {
            for subslice in 0..topo.subslices_per_slice {
                if !topo.is_enabled(slice, subslice) {
                    continue;
                }
                for eu in 0..topo.eus_per_subslice {
                    for thread in 0..topo.threads_per_eu {
                        let id = ThreadId::new(tile, slice, subslice, eu, thread);
                        if pattern.contains(&self.to_api(&id)) {
                            out.push(id);
                        }
                    }
                }
            }
        }
        out
    }

    pub fn single_threads(&self, pattern: &ThreadPattern) -> Vec<ThreadId> {
        self.tiles_of(pattern)
            .into_iter()
            .filter(|tile| *tile < self.tiles)
            .flat_map(|tile| self.threads_in_tile(tile, pattern))
            .collect()
    }

    /// Offset of a thread's private scratch inside a scratch surface with `ptss` bytes per thread.
    ///
    /// Each tile has its own scratch surface, so the slice index is tile-local.
    pub fn per_thread_scratch_offset(&self, ptss: u64, id: &ThreadId) -> u64 {
        let topo = &self.topology;
        let threads_per_eu = u64::from(topo.threads_per_eu.max(1));
        let ratio = u64::from(self.thread_eu_ratio_for_scratch);
        let ptss = if ratio / threads_per_eu > 1 {
            ptss * (ratio / threads_per_eu)
        } else {
            ptss
        };
        let slice = u64::from(id.slice);
        (((slice * u64::from(topo.subslices_per_slice) + u64::from(id.subslice))
            * u64::from(topo.eus_per_subslice)
            + u64::from(id.eu))
            * threads_per_eu
            + u64::from(id.thread))
            * ptss
    }
}
