//! Splicing template stops into a method-level stop table
//!
//! As each template's code is appended to the method at cumulative offset
//! `pos`, its stops are re-based by `pos` and tagged with the instruction's
//! bytecode index. Stops for one bytecode index accumulate into a single
//! bytecode index map entry, flushed when the next index arrives.

use std::fmt;

use serde::Serialize;
use tracing::{debug, trace};

use crate::bsm::{BytecodeIndexMap, BytecodeIndexMapBuilder};
use crate::callee::CalleeId;
use crate::error::{Result, StopsError};
use crate::stop::{Stop, StopFlags};
use crate::table::{PackConfig, PackedStops, StopTableBuilder};
use crate::template::Template;

/// Supplies the concrete target of an instruction's direct bytecode call
pub trait CalleeResolver {
    /// Resolve the callee of `template` placed at `bci`
    fn resolve(&mut self, template: &Template, bci: u32) -> Option<CalleeId>;
}

impl<F> CalleeResolver for F
where
    F: FnMut(&Template, u32) -> Option<CalleeId>,
{
    fn resolve(&mut self, template: &Template, bci: u32) -> Option<CalleeId> {
        self(template, bci)
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    bci: u32,
    stops: u32,
}

/// Builds a method's stop table and bytecode index map from templates
#[derive(Debug, Default)]
pub struct TemplateStopsAssembler {
    table: StopTableBuilder,
    map: BytecodeIndexMapBuilder,
    pending: Option<PendingEntry>,
}

impl TemplateStopsAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops added so far, in emission order
    pub fn stops(&self) -> &[Stop] {
        self.table.stops()
    }

    /// Splice `template`, whose code was placed at `position`
    ///
    /// `bci` is `None` for synthetic code such as a prologue; such stops are
    /// kept out of the bytecode index map. `callee` binds the template's
    /// direct bytecode call and must be given exactly when it has one.
    /// Returns the number of stops added.
    pub fn add_template(
        &mut self,
        template: &Template,
        position: u32,
        bci: Option<u32>,
        callee: Option<CalleeId>,
    ) -> Result<usize> {
        match (template.has_direct_bytecode_call(), callee) {
            (true, None) => {
                return Err(StopsError::UnresolvedBytecodeCall {
                    template: template.name().to_string(),
                    bci: bci.unwrap_or_default(),
                });
            }
            (false, Some(_)) => {
                return Err(StopsError::UnexpectedCallee {
                    template: template.name().to_string(),
                });
            }
            _ => {}
        }
        if let Some(bci) = bci {
            self.check_bci(bci)?;
        }

        for ts in template.stops() {
            let mut stop = Stop::new(
                ts.flags,
                position + ts.position,
                position + ts.cause_position,
                bci,
            );
            if ts.is_bytecode_call() {
                // Template slots are dead across the instruction's own call
                if ts.flags.contains(StopFlags::DIRECT_CALL) {
                    stop.callee = callee;
                }
            } else {
                stop.callee = ts.callee;
                stop.frame_ref_map = ts.frame_ref_map.clone();
                if !ts.flags.is_call() {
                    stop.register_ref_map = ts.register_ref_map.clone();
                }
            }
            trace!(template = template.name(), %stop, "spliced stop");
            self.table.add(stop)?;
        }

        let added = template.stops().len();
        if let Some(bci) = bci {
            self.record(bci, added as u32)?;
        }
        debug!(
            template = template.name(),
            position,
            bci = ?bci,
            stops = added,
            "spliced template"
        );
        Ok(added)
    }

    /// Splice `template` at `bci`, asking `resolver` for its bytecode call target
    pub fn add_with_resolver(
        &mut self,
        template: &Template,
        position: u32,
        bci: u32,
        resolver: &mut dyn CalleeResolver,
    ) -> Result<usize> {
        let callee = if template.has_direct_bytecode_call() {
            resolver.resolve(template, bci)
        } else {
            None
        };
        self.add_template(template, position, Some(bci), callee)
    }

    /// Add the safepoint polled on a loop back-edge at `bci`
    pub fn add_backward_branch(&mut self, bci: u32, position: u32) -> Result<()> {
        self.check_bci(bci)?;
        self.table.add(Stop::backward_branch(position, bci))?;
        self.record(bci, 1)?;
        debug!(bci, position, "added backward branch safepoint");
        Ok(())
    }

    /// Flush the last entry and pack the stop table
    pub fn finish(mut self, config: &PackConfig) -> Result<PackedMethodStops> {
        self.flush()?;
        let first_stop_index = self.table.unmapped_stops() as u32;
        let map = self.map.finish(first_stop_index)?;
        let stops = self.table.pack(&map, config)?;
        debug!(
            stops = stops.len(),
            entries = map.num_entries(),
            first_stop_index,
            "assembled method stops"
        );
        Ok(PackedMethodStops { stops, map })
    }

    fn check_bci(&self, bci: u32) -> Result<()> {
        let prev = match self.pending {
            Some(p) if p.bci == bci => return Ok(()),
            Some(p) => Some(p.bci),
            None => self.map.last_bci(),
        };
        match prev {
            Some(prev) if bci <= prev => Err(StopsError::NonIncreasingBci { prev, bci }),
            _ => Ok(()),
        }
    }

    fn record(&mut self, bci: u32, stops: u32) -> Result<()> {
        match &mut self.pending {
            Some(p) if p.bci == bci => p.stops += stops,
            _ => {
                self.flush()?;
                self.pending = Some(PendingEntry { bci, stops });
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(p) = self.pending.take() {
            if p.stops > 0 {
                self.map.append_entry(p.bci, p.stops)?;
            }
        }
        Ok(())
    }
}

/// A method's packed stop table together with its bytecode index map
#[derive(Debug, Clone, Serialize)]
pub struct PackedMethodStops {
    /// Region-ordered stops
    pub stops: PackedStops,
    /// Bytecode index map over the mapped stops
    pub map: BytecodeIndexMap,
}

impl PackedMethodStops {
    /// Bytecode index of the stop at code position `position`
    pub fn bci_at(&self, position: u32) -> Option<u32> {
        self.stops
            .stop_index_at(position)
            .and_then(|i| self.stops.bci(i))
    }
}

impl fmt::Display for PackedMethodStops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "stops: {} ({} direct, {} indirect, {} safepoints)",
            self.stops.len(),
            self.stops.num_direct_calls(),
            self.stops.num_indirect_calls(),
            self.stops.num_safepoints()
        )?;
        write!(f, "{}", self.stops)?;
        writeln!(f, "bytecode index map (first stop {}):", self.map.first_stop_index())?;
        for (bci, range) in self.map.entries() {
            writeln!(f, "  bci {:4}: stops {:?}", bci, range)?;
        }
        Ok(())
    }
}
