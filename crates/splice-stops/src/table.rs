//! Stop tables
//!
//! A `StopTableBuilder` collects stops in emission order while a method's
//! code is assembled. Packing consumes the builder and produces an immutable
//! `PackedStops` in which stops are laid out by region:
//!
//! ```text
//! [ direct calls | indirect calls | safepoints ]
//! ```
//!
//! All per-stop arrays (positions, flags, reference maps) are indexed by
//! this table index. The bytecode index map orders stops differently
//! (unmapped stops first, then mapped stops in emission order); packing
//! records the permutation between the two orders.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bitmap::{byte_bits, bytes_for_bits, get_byte_bit, set_byte_bit, BitMap};
use crate::bsm::BytecodeIndexMap;
use crate::callee::CalleeId;
use crate::error::{Result, StopsError};
use crate::stop::{Stop, StopFlags, StopKind};

/// Reference-map geometry used when packing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackConfig {
    /// Width of each stop's frame reference map in bits
    pub frame_map_bits: usize,
    /// Width of each stop's register reference map in bits
    pub register_map_bits: usize,
    /// Frame bit at which template-local slot 0 lives
    pub template_slot_base: usize,
}

/// Target of a packed direct call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DirectCallee {
    /// A runtime helper called from template code
    Runtime(CalleeId),
    /// The call performed by the bytecode instruction itself
    Bytecode(CalleeId),
}

impl DirectCallee {
    /// The call target
    pub fn id(&self) -> CalleeId {
        match *self {
            DirectCallee::Runtime(id) | DirectCallee::Bytecode(id) => id,
        }
    }

    /// Check if this is a template-internal runtime call
    pub fn is_runtime_call(&self) -> bool {
        matches!(self, DirectCallee::Runtime(_))
    }
}

/// Append-only collection of stops for one method
#[derive(Debug, Default)]
pub struct StopTableBuilder {
    stops: Vec<Stop>,
    region_counts: [usize; 3],
}

impl StopTableBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty builder with room for `capacity` stops
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            stops: Vec::with_capacity(capacity),
            region_counts: [0; 3],
        }
    }

    /// Append a stop to the region selected by its flags
    ///
    /// Returns the stop's emission index.
    pub fn add(&mut self, stop: Stop) -> Result<usize> {
        let kind = stop.flags.validate()?;
        self.region_counts[kind.ordinal()] += 1;
        self.stops.push(stop);
        Ok(self.stops.len() - 1)
    }

    /// Stops in emission order
    pub fn stops(&self) -> &[Stop] {
        &self.stops
    }

    /// Number of stops
    pub fn len(&self) -> usize {
        self.stops.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Number of stops in a region
    pub fn count(&self, kind: StopKind) -> usize {
        self.region_counts[kind.ordinal()]
    }

    /// Number of stops with no bytecode index
    pub fn unmapped_stops(&self) -> usize {
        self.stops.iter().filter(|s| s.bci.is_none()).count()
    }

    /// Pack the stops into their final, region-ordered form
    ///
    /// `map` must describe exactly the mapped stops of this table, in
    /// emission order, with `first_stop_index` equal to the number of
    /// unmapped stops.
    pub fn pack(self, map: &BytecodeIndexMap, config: &PackConfig) -> Result<PackedStops> {
        let n = self.stops.len();
        if n > 0 && config.frame_map_bits == 0 {
            return Err(StopsError::EmptyFrameMap { stops: n });
        }

        // Table index of each stop, by emission index
        let mut next_in_region = [
            0,
            self.region_counts[0],
            self.region_counts[0] + self.region_counts[1],
        ];
        let mut table_of_emission = Vec::with_capacity(n);
        for stop in &self.stops {
            let region = stop.flags.validate()?.ordinal();
            table_of_emission.push(next_in_region[region]);
            next_in_region[region] += 1;
        }

        // Bsm order: unmapped stops first, then mapped stops in emission order
        let mut emission_of_bsm: Vec<usize> = Vec::with_capacity(n);
        emission_of_bsm.extend((0..n).filter(|&e| self.stops[e].bci.is_none()));
        let unmapped = emission_of_bsm.len();
        emission_of_bsm.extend((0..n).filter(|&e| self.stops[e].bci.is_some()));

        check_consistency(&self.stops, &emission_of_bsm, &table_of_emission, unmapped, map)?;

        let mut bsm_to_table = vec![0u32; n];
        let mut table_to_bsm = vec![0u32; n];
        for (bsm, &e) in emission_of_bsm.iter().enumerate() {
            let t = table_of_emission[e];
            bsm_to_table[bsm] = t as u32;
            table_to_bsm[t] = bsm as u32;
        }

        let frame_map_bytes = bytes_for_bits(config.frame_map_bits);
        let register_map_bytes = bytes_for_bits(config.register_map_bits);
        let ref_map_size = frame_map_bytes + register_map_bytes;

        let mut positions = vec![0u32; n];
        let mut cause_positions = vec![0u32; n];
        let mut flags = vec![StopFlags::NONE; n];
        let mut bcis = vec![None; n];
        let mut direct_callees = Vec::with_capacity(self.region_counts[0]);
        let mut runtime_calls = BitMap::new();
        let mut ref_maps = vec![0u8; n * ref_map_size];

        for (e, stop) in self.stops.iter().enumerate() {
            let t = table_of_emission[e];
            positions[t] = stop.position;
            cause_positions[t] = stop.cause_position;
            flags[t] = stop.flags;
            bcis[t] = stop.bci;

            let in_template = stop.flags.contains(StopFlags::IN_TEMPLATE);
            if stop.flags.contains(StopFlags::DIRECT_CALL) {
                let callee = stop.callee.ok_or(StopsError::MissingCallee {
                    index: t,
                    position: stop.position,
                })?;
                let callee = if in_template {
                    runtime_calls.set(t);
                    DirectCallee::Runtime(callee)
                } else {
                    DirectCallee::Bytecode(callee)
                };
                direct_callees.push((t, callee));
            }

            let frame_offset = t * ref_map_size;
            match &stop.frame_ref_map {
                Some(map) => {
                    let shift = if in_template { config.template_slot_base } else { 0 };
                    for bit in map.iter() {
                        let slot = bit + shift;
                        if slot >= config.frame_map_bits {
                            return Err(StopsError::BitOutOfRange {
                                index: t,
                                bit: slot,
                                width: config.frame_map_bits,
                            });
                        }
                        set_byte_bit(&mut ref_maps, frame_offset, slot);
                    }
                }
                None if in_template => {
                    return Err(StopsError::MissingFrameRefMap {
                        index: t,
                        position: stop.position,
                    });
                }
                None => {}
            }

            if let Some(map) = &stop.register_ref_map {
                if stop.flags.is_call() {
                    return Err(StopsError::RegisterMapOnCall {
                        index: t,
                        position: stop.position,
                    });
                }
                let reg_offset = frame_offset + frame_map_bytes;
                for bit in map.iter() {
                    if bit >= config.register_map_bits {
                        return Err(StopsError::BitOutOfRange {
                            index: t,
                            bit,
                            width: config.register_map_bits,
                        });
                    }
                    set_byte_bit(&mut ref_maps, reg_offset, bit);
                }
            }
        }

        direct_callees.sort_unstable_by_key(|&(t, _)| t);
        let direct_callees = direct_callees.into_iter().map(|(_, c)| c).collect();

        debug!(
            stops = n,
            direct = self.region_counts[0],
            indirect = self.region_counts[1],
            safepoints = self.region_counts[2],
            unmapped,
            ref_map_bytes = ref_maps.len(),
            "packed stop table"
        );

        Ok(PackedStops {
            positions,
            cause_positions,
            flags,
            bcis,
            num_direct_calls: self.region_counts[0],
            num_indirect_calls: self.region_counts[1],
            direct_callees,
            runtime_calls,
            frame_map_bits: config.frame_map_bits,
            register_map_bits: config.register_map_bits,
            frame_map_bytes,
            register_map_bytes,
            ref_maps,
            table_to_bsm,
            bsm_to_table,
        })
    }
}

/// Verify the map walks the stops it claims to describe
fn check_consistency(
    stops: &[Stop],
    emission_of_bsm: &[usize],
    table_of_emission: &[usize],
    unmapped: usize,
    map: &BytecodeIndexMap,
) -> Result<()> {
    if map.first_stop_index() as usize != unmapped {
        return Err(StopsError::StopCountMismatch {
            mapped: map.first_stop_index() as usize,
            actual: unmapped,
        });
    }
    if map.total_stops() != stops.len() {
        return Err(StopsError::StopCountMismatch {
            mapped: map.total_stops(),
            actual: stops.len(),
        });
    }
    for (bci, range) in map.entries() {
        for bsm in range {
            let e = emission_of_bsm[bsm as usize];
            if stops[e].bci != Some(bci) {
                return Err(StopsError::BciMismatch {
                    index: table_of_emission[e],
                    expected: bci,
                    actual: stops[e].bci,
                });
            }
        }
    }
    Ok(())
}

/// Immutable, region-ordered stop table
#[derive(Debug, Clone, Serialize)]
pub struct PackedStops {
    positions: Vec<u32>,
    cause_positions: Vec<u32>,
    flags: Vec<StopFlags>,
    bcis: Vec<Option<u32>>,
    num_direct_calls: usize,
    num_indirect_calls: usize,
    direct_callees: Vec<DirectCallee>,
    runtime_calls: BitMap,
    frame_map_bits: usize,
    register_map_bits: usize,
    frame_map_bytes: usize,
    register_map_bytes: usize,
    ref_maps: Vec<u8>,
    table_to_bsm: Vec<u32>,
    bsm_to_table: Vec<u32>,
}

impl PackedStops {
    /// Number of stops
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Table index range of a region
    pub fn region(&self, kind: StopKind) -> Range<usize> {
        let d = self.num_direct_calls;
        let i = self.num_indirect_calls;
        match kind {
            StopKind::DirectCall => 0..d,
            StopKind::IndirectCall => d..d + i,
            StopKind::Safepoint => d + i..self.len(),
        }
    }

    /// Number of direct calls
    pub fn num_direct_calls(&self) -> usize {
        self.num_direct_calls
    }

    /// Number of indirect calls
    pub fn num_indirect_calls(&self) -> usize {
        self.num_indirect_calls
    }

    /// Number of safepoints
    pub fn num_safepoints(&self) -> usize {
        self.len() - self.num_direct_calls - self.num_indirect_calls
    }

    /// Code positions by table index
    pub fn positions(&self) -> &[u32] {
        &self.positions
    }

    /// Code position of stop `index`
    pub fn position(&self, index: usize) -> u32 {
        self.positions[index]
    }

    /// Position of the instruction causing stop `index`
    pub fn cause_position(&self, index: usize) -> u32 {
        self.cause_positions[index]
    }

    /// Flags of stop `index`
    pub fn flags(&self, index: usize) -> StopFlags {
        self.flags[index]
    }

    /// Bytecode index of stop `index`
    pub fn bci(&self, index: usize) -> Option<u32> {
        self.bcis[index]
    }

    /// Direct call targets, aligned with the direct-call region
    pub fn direct_callees(&self) -> &[DirectCallee] {
        &self.direct_callees
    }

    /// Check if direct call `index` is a template-internal runtime call
    pub fn is_runtime_call(&self, index: usize) -> bool {
        self.runtime_calls.get(index)
    }

    /// Width of each frame reference map in bits
    pub fn frame_map_bits(&self) -> usize {
        self.frame_map_bits
    }

    /// Width of each register reference map in bits
    pub fn register_map_bits(&self) -> usize {
        self.register_map_bits
    }

    /// Bytes per stop in the combined reference-map buffer
    pub fn ref_map_size(&self) -> usize {
        self.frame_map_bytes + self.register_map_bytes
    }

    /// The combined reference-map buffer
    pub fn ref_maps(&self) -> &[u8] {
        &self.ref_maps
    }

    /// Frame reference map bytes of stop `index`
    pub fn frame_ref_map(&self, index: usize) -> &[u8] {
        let start = index * self.ref_map_size();
        &self.ref_maps[start..start + self.frame_map_bytes]
    }

    /// Register reference map bytes of stop `index`
    pub fn register_ref_map(&self, index: usize) -> &[u8] {
        let start = index * self.ref_map_size() + self.frame_map_bytes;
        &self.ref_maps[start..start + self.register_map_bytes]
    }

    /// Frame slots marked as references at stop `index`
    pub fn frame_refs(&self, index: usize) -> Vec<usize> {
        byte_bits(self.frame_ref_map(index)).collect()
    }

    /// Registers marked as references at stop `index`
    pub fn register_refs(&self, index: usize) -> Vec<usize> {
        byte_bits(self.register_ref_map(index)).collect()
    }

    /// Check if frame slot `bit` holds a reference at stop `index`
    pub fn is_frame_ref(&self, index: usize, bit: usize) -> bool {
        bit < self.frame_map_bits
            && get_byte_bit(&self.ref_maps, index * self.ref_map_size(), bit)
    }

    /// Mark frame slot `bit` of stop `index`; returns whether it was already set
    pub(crate) fn mark_frame_ref(&mut self, index: usize, bit: usize) -> Result<bool> {
        if bit >= self.frame_map_bits {
            return Err(StopsError::BitOutOfRange {
                index,
                bit,
                width: self.frame_map_bits,
            });
        }
        let offset = index * self.ref_map_size();
        let was_set = get_byte_bit(&self.ref_maps, offset, bit);
        set_byte_bit(&mut self.ref_maps, offset, bit);
        Ok(was_set)
    }

    /// Position of stop `index` in bytecode index map order
    pub fn bsm_index(&self, index: usize) -> u32 {
        self.table_to_bsm[index]
    }

    /// Table index of the stop at bytecode index map position `bsm_index`
    pub fn table_index(&self, bsm_index: u32) -> usize {
        self.bsm_to_table[bsm_index as usize] as usize
    }

    /// Table index of the stop at code position `position`
    pub fn stop_index_at(&self, position: u32) -> Option<usize> {
        StopKind::ALL
            .iter()
            .flat_map(|&kind| self.region(kind))
            .find(|&i| self.positions[i] == position)
    }
}

impl fmt::Display for PackedStops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.len() {
            write!(f, "{:4}: {} @ {}", i, self.flags[i], self.positions[i])?;
            match self.bcis[i] {
                Some(bci) => write!(f, " [bci: {}", bci)?,
                None => f.write_str(" [bci: -")?,
            }
            if i < self.num_direct_calls {
                write!(f, ", callee: {}", self.direct_callees[i].id())?;
            }
            write!(f, ", frame: {{")?;
            for (k, bit) in self.frame_refs(i).into_iter().enumerate() {
                if k > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", bit)?;
            }
            f.write_str("}")?;
            let regs = self.register_refs(i);
            if !regs.is_empty() {
                write!(f, ", regs: {:?}", regs)?;
            }
            writeln!(f, "]")?;
        }
        Ok(())
    }
}
