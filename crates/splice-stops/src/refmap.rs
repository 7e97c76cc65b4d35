//! Reference-map finalization
//!
//! Template reference maps only describe template scratch slots. Which
//! locals and operand-stack slots hold references at a stop depends on the
//! whole method's type state, so it is filled in after packing by walking
//! the bytecode index map alongside a block-level reference interpreter.
//!
//! The interpreter reports each bci's live slots through a
//! `ReferenceSlotVisitor` twice for invoke-like instructions: once before
//! the call's parameters are popped and once after. The bytecode call stop
//! takes its stack slots from the post-pop visit; every other stop at that
//! bci takes them from the pre-pop visit. Each slot is thus marked at most
//! once per stop.

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::assembler::PackedMethodStops;
use crate::bitmap::BitMap;
use crate::bsm::{BciCursor, BytecodeIndexMap, BytecodeIndexMapIterator};
use crate::error::{Result, StopsError};
use crate::frame::FrameLayout;
use crate::table::PackedStops;

/// Sorted bytecode indices at which basic blocks start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockStarts {
    starts: Vec<u32>,
}

impl BlockStarts {
    /// Create from strictly increasing block start bcis
    pub fn new(starts: Vec<u32>) -> Result<Self> {
        for pair in starts.windows(2) {
            if pair[1] <= pair[0] {
                return Err(StopsError::NonIncreasingBci {
                    prev: pair[0],
                    bci: pair[1],
                });
            }
        }
        Ok(Self { starts })
    }

    /// Create from per-bci block start flags
    pub fn from_flags(flags: &[bool]) -> Self {
        let starts = flags
            .iter()
            .enumerate()
            .filter(|(_, start)| **start)
            .map(|(bci, _)| bci as u32)
            .collect();
        Self { starts }
    }

    /// Block start bcis
    pub fn starts(&self) -> &[u32] {
        &self.starts
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.starts.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Index of the block containing `bci`
    pub fn block_index_for(&self, bci: u32) -> Option<usize> {
        self.starts.partition_point(|&s| s <= bci).checked_sub(1)
    }
}

/// Receives the reference-holding slots at the current bci
pub trait ReferenceSlotVisitor {
    /// Local variable `index` holds a reference
    fn visit_reference_in_local(&mut self, index: usize) -> Result<()>;

    /// Operand stack slot `index` (0 is the bottom) holds a reference
    ///
    /// `parameters_popped` is set when the visit reflects the stack after an
    /// invoke has popped its parameters.
    fn visit_reference_on_operand_stack(
        &mut self,
        index: usize,
        parameters_popped: bool,
    ) -> Result<()>;
}

/// A bci cursor that also receives slot visits
pub trait RefSlotWalk: BciCursor + ReferenceSlotVisitor {}

impl<T: BciCursor + ReferenceSlotVisitor> RefSlotWalk for T {}

/// Block-level reference interpreter
pub trait ReferenceMapInterpreter {
    /// Check that the interpreter can describe every stop of `stops`
    fn check_stops(&self, _stops: &PackedStops) -> Result<()> {
        Ok(())
    }

    /// Reset `walk`, then for each of its bcis in reachable code visit the
    /// live reference slots before advancing
    fn interpret_reference_slots(
        &mut self,
        blocks: &BlockStarts,
        walk: &mut dyn RefSlotWalk,
    ) -> Result<()>;
}

/// Reference slots live at one bci
///
/// The state at a bci hosting a bytecode call must carry `popped_depth`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameState {
    /// Locals holding references
    pub locals: BitMap,
    /// Operand stack depth before the instruction executes
    pub stack_depth: u32,
    /// Operand stack slots holding references
    pub stack_refs: BitMap,
    /// Stack depth once an invoke has popped its parameters
    pub popped_depth: Option<u32>,
}

/// A reference interpreter replaying recorded per-bci frame states
#[derive(Debug, Clone)]
pub struct RecordedFrames {
    layout: FrameLayout,
    states: FxHashMap<u32, FrameState>,
}

impl RecordedFrames {
    /// Create an empty recording for frames of `layout`
    pub fn new(layout: FrameLayout) -> Self {
        Self {
            layout,
            states: FxHashMap::default(),
        }
    }

    /// Record the frame state at `bci`
    pub fn record(&mut self, bci: u32, state: FrameState) -> Result<()> {
        let out_of_range = |detail: String| StopsError::FrameStateOutOfRange { bci, detail };
        if state.locals.width() > self.layout.max_locals {
            return Err(out_of_range(format!(
                "local {} beyond max_locals {}",
                state.locals.width() - 1,
                self.layout.max_locals
            )));
        }
        if state.stack_depth as usize > self.layout.max_stack {
            return Err(out_of_range(format!(
                "stack depth {} beyond max_stack {}",
                state.stack_depth, self.layout.max_stack
            )));
        }
        if state.stack_refs.width() > state.stack_depth as usize {
            return Err(out_of_range(format!(
                "stack slot {} beyond depth {}",
                state.stack_refs.width() - 1,
                state.stack_depth
            )));
        }
        if let Some(popped) = state.popped_depth {
            if popped > state.stack_depth {
                return Err(out_of_range(format!(
                    "popped depth {} above depth {}",
                    popped, state.stack_depth
                )));
            }
        }
        self.states.insert(bci, state);
        Ok(())
    }

    /// Recorded state at `bci`
    pub fn state(&self, bci: u32) -> Option<&FrameState> {
        self.states.get(&bci)
    }

    fn reachable_blocks(&self, blocks: &BlockStarts) -> BitMap {
        self.states
            .keys()
            .filter_map(|&bci| blocks.block_index_for(bci))
            .collect()
    }
}

impl ReferenceMapInterpreter for RecordedFrames {
    fn check_stops(&self, stops: &PackedStops) -> Result<()> {
        for index in 0..stops.len() {
            if !stops.flags(index).is_bytecode_call() {
                continue;
            }
            let Some(bci) = stops.bci(index) else {
                continue;
            };
            if self.states.get(&bci).is_some_and(|s| s.popped_depth.is_none()) {
                return Err(StopsError::FrameStateOutOfRange {
                    bci,
                    detail: format!("bytecode call stop {} needs a popped depth", index),
                });
            }
        }
        Ok(())
    }

    fn interpret_reference_slots(
        &mut self,
        blocks: &BlockStarts,
        walk: &mut dyn RefSlotWalk,
    ) -> Result<()> {
        let reachable = self.reachable_blocks(blocks);
        walk.reset();
        while let Some(bci) = walk.bci() {
            let live = blocks
                .block_index_for(bci)
                .is_some_and(|block| reachable.get(block));
            if !live {
                trace!(bci, "skipping unreachable bci");
                walk.advance();
                continue;
            }
            let state = self
                .states
                .get(&bci)
                .ok_or_else(|| StopsError::FrameStateOutOfRange {
                    bci,
                    detail: "no frame state recorded in reachable block".to_string(),
                })?;

            for local in state.locals.iter() {
                walk.visit_reference_in_local(local)?;
            }
            for slot in state.stack_refs.iter() {
                walk.visit_reference_on_operand_stack(slot, false)?;
            }
            if let Some(depth) = state.popped_depth {
                for slot in state.stack_refs.iter().take_while(|&s| s < depth as usize) {
                    walk.visit_reference_on_operand_stack(slot, true)?;
                }
            }
            walk.advance();
        }
        Ok(())
    }
}

/// Counters from one finalization pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FinalizeReport {
    /// Bytecode indices the interpreter walked
    pub bcis_visited: usize,
    /// Stops belonging to those bytecode indices
    pub stops_visited: usize,
    /// Reference-map bits newly set
    pub bits_set: usize,
    /// Marks that hit an already set bit
    pub redundant_marks: usize,
}

/// Fills in local and operand-stack liveness of packed stops
#[derive(Debug, Clone, Copy)]
pub struct ReferenceMapFinalizer {
    layout: FrameLayout,
}

impl ReferenceMapFinalizer {
    /// Create a finalizer for frames of `layout`
    pub fn new(layout: FrameLayout) -> Self {
        Self { layout }
    }

    /// Check that `stops` and `map` describe the same stops
    pub fn check_consistency(&self, stops: &PackedStops, map: &BytecodeIndexMap) -> Result<()> {
        if map.total_stops() != stops.len() {
            return Err(StopsError::StopCountMismatch {
                mapped: map.total_stops(),
                actual: stops.len(),
            });
        }
        for (bci, range) in map.entries() {
            for bsm in range {
                let index = stops.table_index(bsm);
                if stops.bci(index) != Some(bci) {
                    return Err(StopsError::BciMismatch {
                        index,
                        expected: bci,
                        actual: stops.bci(index),
                    });
                }
            }
        }
        Ok(())
    }

    /// Mark every reference slot the interpreter reports in the stops'
    /// frame reference maps
    pub fn finalize(
        &self,
        method: &mut PackedMethodStops,
        blocks: &BlockStarts,
        interpreter: &mut dyn ReferenceMapInterpreter,
    ) -> Result<FinalizeReport> {
        let PackedMethodStops { stops, map } = method;
        self.check_consistency(stops, map)?;
        interpreter.check_stops(stops)?;

        let mut walk = FinalizeWalk {
            iter: map.iter(),
            stops,
            layout: self.layout,
            report: FinalizeReport::default(),
        };
        interpreter.interpret_reference_slots(blocks, &mut walk)?;

        let report = walk.report;
        debug!(
            bcis = report.bcis_visited,
            stops = report.stops_visited,
            bits = report.bits_set,
            redundant = report.redundant_marks,
            "finalized reference maps"
        );
        Ok(report)
    }
}

struct FinalizeWalk<'a> {
    iter: BytecodeIndexMapIterator<'a>,
    stops: &'a mut PackedStops,
    layout: FrameLayout,
    report: FinalizeReport,
}

impl FinalizeWalk<'_> {
    fn enter_entry(&mut self) {
        if let Some(range) = self.iter.entry_stops() {
            self.report.bcis_visited += 1;
            self.report.stops_visited += range.len();
        }
    }

    fn slot_out_of_range(&self, detail: String) -> StopsError {
        StopsError::FrameStateOutOfRange {
            bci: self.iter.bci().unwrap_or_default(),
            detail,
        }
    }

    /// Mark `bit` in each stop at the current bci accepted by `filter`
    fn mark(&mut self, bit: usize, filter: impl Fn(&PackedStops, usize) -> bool) -> Result<()> {
        let mut next = self.iter.next_stop_index(true);
        while let Some(bsm) = next {
            let index = self.stops.table_index(bsm);
            if filter(&*self.stops, index) {
                if self.stops.mark_frame_ref(index, bit)? {
                    self.report.redundant_marks += 1;
                } else {
                    self.report.bits_set += 1;
                }
                trace!(stop = index, bit, "marked reference slot");
            }
            next = self.iter.next_stop_index(false);
        }
        Ok(())
    }
}

impl BciCursor for FinalizeWalk<'_> {
    fn reset(&mut self) {
        self.iter.reset();
        self.report = FinalizeReport::default();
        self.enter_entry();
    }

    fn bci(&self) -> Option<u32> {
        self.iter.bci()
    }

    fn advance(&mut self) -> Option<u32> {
        let bci = self.iter.advance();
        self.enter_entry();
        bci
    }
}

impl ReferenceSlotVisitor for FinalizeWalk<'_> {
    fn visit_reference_in_local(&mut self, index: usize) -> Result<()> {
        if index >= self.layout.max_locals {
            return Err(self.slot_out_of_range(format!(
                "local {} beyond max_locals {}",
                index, self.layout.max_locals
            )));
        }
        let bit = self.layout.local_bit(index);
        self.mark(bit, |_, _| true)
    }

    fn visit_reference_on_operand_stack(
        &mut self,
        index: usize,
        parameters_popped: bool,
    ) -> Result<()> {
        if index >= self.layout.max_stack {
            return Err(self.slot_out_of_range(format!(
                "stack slot {} beyond max_stack {}",
                index, self.layout.max_stack
            )));
        }
        let bit = self.layout.stack_bit(index);
        self.mark(bit, |stops, i| {
            stops.flags(i).is_bytecode_call() == parameters_popped
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::TemplateStopsAssembler;
    use crate::callee::CalleeId;
    use crate::template::TemplateBuilder;

    fn layout() -> FrameLayout {
        FrameLayout::new(3, 4, 2, 8)
    }

    #[test]
    fn test_block_index_for() {
        let blocks = BlockStarts::new(vec![0, 4, 10]).unwrap();
        assert_eq!(blocks.block_index_for(0), Some(0));
        assert_eq!(blocks.block_index_for(3), Some(0));
        assert_eq!(blocks.block_index_for(4), Some(1));
        assert_eq!(blocks.block_index_for(99), Some(2));

        let late = BlockStarts::new(vec![2]).unwrap();
        assert_eq!(late.block_index_for(1), None);

        assert!(BlockStarts::new(vec![0, 4, 4]).is_err());
        assert_eq!(
            BlockStarts::from_flags(&[true, false, false, true]).starts(),
            &[0, 3]
        );
    }

    #[test]
    fn test_record_validates_shape() {
        let mut frames = RecordedFrames::new(layout());
        let bad_local = FrameState {
            locals: BitMap::from_bits([3]),
            ..FrameState::default()
        };
        assert!(matches!(
            frames.record(0, bad_local),
            Err(StopsError::FrameStateOutOfRange { bci: 0, .. })
        ));

        let bad_stack = FrameState {
            stack_depth: 1,
            stack_refs: BitMap::from_bits([1]),
            ..FrameState::default()
        };
        assert!(frames.record(0, bad_stack).is_err());
        assert!(frames.state(0).is_none());
    }

    #[test]
    fn test_invoke_marks_stack_once_per_stop() {
        let invoke = TemplateBuilder::new("invokestatic", 20)
            .safepoint(2, BitMap::new(), None)
            .direct_bytecode_call(10, 5)
            .build()
            .unwrap();
        let mut asm = TemplateStopsAssembler::new();
        asm.add_template(&invoke, 0, Some(0), Some(CalleeId(0)))
            .unwrap();
        let mut method = asm.finish(&layout().pack_config()).unwrap();

        // Stack slot 0 survives the call, slot 1 is its argument
        let mut frames = RecordedFrames::new(layout());
        frames
            .record(
                0,
                FrameState {
                    locals: BitMap::from_bits([0]),
                    stack_depth: 2,
                    stack_refs: BitMap::from_bits([0, 1]),
                    popped_depth: Some(1),
                },
            )
            .unwrap();

        let blocks = BlockStarts::new(vec![0]).unwrap();
        let report = ReferenceMapFinalizer::new(layout())
            .finalize(&mut method, &blocks, &mut frames)
            .unwrap();

        // call: local 0 + stack 0 only; safepoint: local 0 + stacks 0, 1
        assert_eq!(method.stops.frame_refs(0), vec![0, 3]);
        assert_eq!(method.stops.frame_refs(1), vec![0, 3, 4]);
        assert_eq!(report.bits_set, 5);
        assert_eq!(report.redundant_marks, 0);
        assert_eq!(report.bcis_visited, 1);
        assert_eq!(report.stops_visited, 2);
    }

    #[test]
    fn test_unreachable_blocks_are_skipped() {
        let poll = TemplateBuilder::new("poll", 4)
            .safepoint(0, BitMap::new(), None)
            .build()
            .unwrap();
        let mut asm = TemplateStopsAssembler::new();
        asm.add_template(&poll, 0, Some(0), None).unwrap();
        asm.add_template(&poll, 4, Some(5), None).unwrap();
        let mut method = asm.finish(&layout().pack_config()).unwrap();

        let mut frames = RecordedFrames::new(layout());
        frames
            .record(
                0,
                FrameState {
                    locals: BitMap::from_bits([2]),
                    ..FrameState::default()
                },
            )
            .unwrap();

        let blocks = BlockStarts::new(vec![0, 5]).unwrap();
        let report = ReferenceMapFinalizer::new(layout())
            .finalize(&mut method, &blocks, &mut frames)
            .unwrap();
        assert_eq!(method.stops.frame_refs(0), vec![2]);
        assert!(method.stops.frame_refs(1).is_empty());
        assert_eq!(report.bcis_visited, 2);
        assert_eq!(report.bits_set, 1);
    }

    #[test]
    fn test_missing_state_in_reachable_block() {
        let mut asm = TemplateStopsAssembler::new();
        asm.add_backward_branch(0, 4).unwrap();
        asm.add_backward_branch(2, 8).unwrap();
        let mut method = asm.finish(&layout().pack_config()).unwrap();

        let mut frames = RecordedFrames::new(layout());
        frames.record(0, FrameState::default()).unwrap();

        let blocks = BlockStarts::new(vec![0]).unwrap();
        let err = ReferenceMapFinalizer::new(layout())
            .finalize(&mut method, &blocks, &mut frames)
            .unwrap_err();
        assert!(matches!(err, StopsError::FrameStateOutOfRange { bci: 2, .. }));
    }

    /// Replays fixed slot visits at every bci, `passes` times over
    struct ScriptedVisits {
        locals: Vec<usize>,
        stack: Vec<(usize, bool)>,
        passes: usize,
    }

    impl ReferenceMapInterpreter for ScriptedVisits {
        fn interpret_reference_slots(
            &mut self,
            _blocks: &BlockStarts,
            walk: &mut dyn RefSlotWalk,
        ) -> Result<()> {
            for _ in 0..self.passes {
                walk.reset();
                while walk.bci().is_some() {
                    for &local in &self.locals {
                        walk.visit_reference_in_local(local)?;
                    }
                    for &(slot, popped) in &self.stack {
                        walk.visit_reference_on_operand_stack(slot, popped)?;
                    }
                    walk.advance();
                }
            }
            Ok(())
        }
    }

    fn single_poll() -> PackedMethodStops {
        let mut asm = TemplateStopsAssembler::new();
        asm.add_backward_branch(0, 4).unwrap();
        asm.finish(&layout().pack_config()).unwrap()
    }

    #[test]
    fn test_local_beyond_layout_is_rejected() {
        let mut method = single_poll();
        let mut visits = ScriptedVisits {
            locals: vec![3],
            stack: vec![],
            passes: 1,
        };
        let err = ReferenceMapFinalizer::new(layout())
            .finalize(&mut method, &BlockStarts::new(vec![0]).unwrap(), &mut visits)
            .unwrap_err();
        assert!(matches!(err, StopsError::FrameStateOutOfRange { bci: 0, .. }));
        assert!(method.stops.frame_refs(0).is_empty());
    }

    #[test]
    fn test_stack_slot_beyond_layout_is_rejected() {
        let mut method = single_poll();
        let mut visits = ScriptedVisits {
            locals: vec![],
            stack: vec![(4, false)],
            passes: 1,
        };
        let err = ReferenceMapFinalizer::new(layout())
            .finalize(&mut method, &BlockStarts::new(vec![0]).unwrap(), &mut visits)
            .unwrap_err();
        assert!(err.to_string().contains("stack slot 4 beyond max_stack 4"));
        assert!(method.stops.frame_refs(0).is_empty());
    }

    #[test]
    fn test_report_reflects_last_walk() {
        let mut method = single_poll();
        let mut visits = ScriptedVisits {
            locals: vec![0, 2],
            stack: vec![(1, false)],
            passes: 2,
        };
        let report = ReferenceMapFinalizer::new(layout())
            .finalize(&mut method, &BlockStarts::new(vec![0]).unwrap(), &mut visits)
            .unwrap();
        assert_eq!(method.stops.frame_refs(0), vec![0, 2, 4]);
        assert_eq!(
            report,
            FinalizeReport {
                bcis_visited: 1,
                stops_visited: 1,
                bits_set: 0,
                redundant_marks: 3,
            }
        );
    }

    #[test]
    fn test_invoke_state_requires_popped_depth() {
        let invoke = TemplateBuilder::new("invokestatic", 20)
            .direct_bytecode_call(10, 5)
            .build()
            .unwrap();
        let mut asm = TemplateStopsAssembler::new();
        asm.add_template(&invoke, 0, Some(4), Some(CalleeId(0)))
            .unwrap();
        let mut method = asm.finish(&layout().pack_config()).unwrap();

        let mut frames = RecordedFrames::new(layout());
        frames
            .record(
                4,
                FrameState {
                    stack_depth: 1,
                    stack_refs: BitMap::from_bits([0]),
                    ..FrameState::default()
                },
            )
            .unwrap();

        let err = ReferenceMapFinalizer::new(layout())
            .finalize(&mut method, &BlockStarts::new(vec![0]).unwrap(), &mut frames)
            .unwrap_err();
        assert!(matches!(err, StopsError::FrameStateOutOfRange { bci: 4, .. }));
    }
}
