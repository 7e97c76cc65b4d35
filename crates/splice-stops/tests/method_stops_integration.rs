//! Integration tests for the assemble → pack → finalize pipeline

use splice_stops::{
    BitMap, BlockStarts, CalleeArena, DirectCallee, FinalizeReport, FrameLayout, FrameState,
    PackedMethodStops, RecordedFrames, ReferenceMapFinalizer, StopFlags, StopKind, StopsError,
    Template, TemplateBuilder, TemplateStopsAssembler,
};

fn layout() -> FrameLayout {
    FrameLayout::new(2, 3, 2, 16)
}

/// Bytecode call at 0, in-template safepoint at 12
fn invoke_template() -> Template {
    TemplateBuilder::new("invokestatic", 16)
        .direct_bytecode_call(0, 0)
        .safepoint(12, BitMap::from_bits([1]), Some(BitMap::from_bits([5])))
        .build()
        .expect("valid template")
}

fn new_template(callees: &mut CalleeArena) -> Template {
    TemplateBuilder::new("new", 24)
        .direct_call(10, 5, callees.intern("Runtime.allocate"), BitMap::from_bits([0]))
        .build()
        .expect("valid template")
}

fn invokevirtual_template() -> Template {
    TemplateBuilder::new("invokevirtual", 20)
        .indirect_bytecode_call(18, 16)
        .build()
        .expect("valid template")
}

/// prologue | new @0 | invokestatic @3 | loop poll @3 | invokevirtual @6
fn assemble(callees: &mut CalleeArena) -> PackedMethodStops {
    let prologue = TemplateBuilder::new("prologue", 8)
        .safepoint(4, BitMap::new(), None)
        .build()
        .expect("valid template");

    let mut asm = TemplateStopsAssembler::new();
    let mut pos = 0;
    asm.add_template(&prologue, pos, None, None).unwrap();
    pos += prologue.code_size();

    let new = new_template(callees);
    asm.add_template(&new, pos, Some(0), None).unwrap();
    pos += new.code_size();

    let invoke = invoke_template();
    let target = callees.intern("Foo.bar()V");
    asm.add_template(&invoke, pos, Some(3), Some(target)).unwrap();
    pos += invoke.code_size();
    asm.add_backward_branch(3, pos).unwrap();
    pos += 4;

    let virt = invokevirtual_template();
    asm.add_template(&virt, pos, Some(6), None).unwrap();

    asm.finish(&layout().pack_config()).expect("pack")
}

#[test]
fn test_splice_at_offset_100() {
    let mut asm = TemplateStopsAssembler::new();
    let mut callees = CalleeArena::new();
    let target = callees.intern("Foo.bar()V");
    asm.add_template(&invoke_template(), 100, Some(7), Some(target))
        .unwrap();
    let method = asm.finish(&layout().pack_config()).unwrap();

    let stops = &method.stops;
    assert_eq!(stops.position(0), 100);
    assert_eq!(stops.position(1), 112);
    assert_eq!(stops.direct_callees(), &[DirectCallee::Bytecode(target)]);
    assert!(stops.frame_refs(0).is_empty());
    assert!(stops.register_refs(0).is_empty());
    // template slot 1 sits above locals and stack
    assert_eq!(stops.frame_refs(1), vec![6]);
    assert_eq!(stops.register_refs(1), vec![5]);
}

#[test]
fn test_regions_partition_table() {
    let mut callees = CalleeArena::new();
    let method = assemble(&mut callees);
    let stops = &method.stops;

    let direct = stops.region(StopKind::DirectCall);
    let indirect = stops.region(StopKind::IndirectCall);
    let safepoints = stops.region(StopKind::Safepoint);
    assert_eq!(direct.start, 0);
    assert_eq!(direct.end, indirect.start);
    assert_eq!(indirect.end, safepoints.start);
    assert_eq!(safepoints.end, stops.len());

    for kind in StopKind::ALL {
        for i in stops.region(kind) {
            assert_eq!(stops.flags(i).kind(), Some(kind));
        }
        let positions: Vec<u32> = stops.region(kind).map(|i| stops.position(i)).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    assert_eq!(stops.num_direct_calls(), 2);
    assert_eq!(stops.num_indirect_calls(), 1);
    assert_eq!(stops.num_safepoints(), 3);
    assert!(stops.is_runtime_call(0));
    assert!(!stops.is_runtime_call(1));
    assert_eq!(
        callees.name(stops.direct_callees()[0].id()),
        Some("Runtime.allocate")
    );
}

#[test]
fn test_stop_counts_round_trip() {
    let mut callees = CalleeArena::new();
    let method = assemble(&mut callees);

    let map = &method.map;
    assert!(map.is_valid());
    assert_eq!(map.first_stop_index(), 1);
    assert_eq!(map.encoding(), &[0, 1, 3, 3, 6, 1]);
    assert_eq!(
        map.mapped_stops() + map.first_stop_index() as usize,
        method.stops.len()
    );

    // every stop reached through an entry carries that entry's bci
    for (bci, range) in map.entries() {
        for bsm in range {
            let index = method.stops.table_index(bsm);
            assert_eq!(method.stops.bci(index), Some(bci));
            assert_eq!(method.stops.bsm_index(index), bsm);
        }
    }
}

#[test]
fn test_bci_lookup_by_position() {
    let mut callees = CalleeArena::new();
    let method = assemble(&mut callees);

    assert_eq!(method.bci_at(4), None);
    assert_eq!(method.bci_at(8 + 10), Some(0));
    assert_eq!(method.bci_at(32), Some(3));
    assert_eq!(method.bci_at(44), Some(3));
    assert_eq!(method.bci_at(48), Some(3));
    assert_eq!(method.bci_at(52 + 18), Some(6));
    assert_eq!(method.bci_at(1), None);
}

#[test]
fn test_finalize_marks_each_slot_once() {
    let mut callees = CalleeArena::new();
    let mut method = assemble(&mut callees);

    let mut frames = RecordedFrames::new(layout());
    frames
        .record(
            0,
            FrameState {
                locals: BitMap::from_bits([0]),
                ..FrameState::default()
            },
        )
        .unwrap();
    // receiver and argument on the stack; slot 0 survives the call
    frames
        .record(
            3,
            FrameState {
                locals: BitMap::from_bits([1]),
                stack_depth: 2,
                stack_refs: BitMap::from_bits([0, 1]),
                popped_depth: Some(1),
            },
        )
        .unwrap();
    frames
        .record(
            6,
            FrameState {
                locals: BitMap::new(),
                stack_depth: 3,
                stack_refs: BitMap::from_bits([0, 2]),
                popped_depth: Some(0),
            },
        )
        .unwrap();

    let blocks = BlockStarts::new(vec![0, 3, 6]).unwrap();
    let report = ReferenceMapFinalizer::new(layout())
        .finalize(&mut method, &blocks, &mut frames)
        .unwrap();

    let stops = &method.stops;
    for i in 0..stops.len() {
        let refs = stops.frame_refs(i);
        match (stops.flags(i), stops.bci(i)) {
            (_, None) => assert!(refs.is_empty()),
            (f, Some(0)) => {
                assert!(f.contains(StopFlags::IN_TEMPLATE));
                // local 0 plus template slot 0
                assert_eq!(refs, vec![0, 5]);
            }
            (f, Some(3)) if f.is_bytecode_call() => assert_eq!(refs, vec![1, 2]),
            (f, Some(3)) if f.contains(StopFlags::IN_TEMPLATE) => {
                assert_eq!(refs, vec![1, 2, 3, 6])
            }
            (f, Some(3)) => {
                assert!(f.contains(StopFlags::BACKWARD_BRANCH));
                assert_eq!(refs, vec![1, 2, 3]);
            }
            (f, Some(6)) => {
                assert!(f.is_bytecode_call());
                assert!(refs.is_empty());
            }
            other => panic!("unexpected stop {:?}", other),
        }
    }

    assert_eq!(report.bcis_visited, 3);
    assert_eq!(report.stops_visited, 5);
    assert_eq!(report.redundant_marks, 0);
    // bci 0: 1, bci 3: call 2 + safepoint 3 + poll 3, bci 6: 0
    assert_eq!(report.bits_set, 9);
}

/// A safepoint-only template and an invoke spliced for the same bci
fn finalize_shared_bci(safepoint_first: bool) -> (PackedMethodStops, FinalizeReport) {
    let check = TemplateBuilder::new("check", 4)
        .safepoint(2, BitMap::from_bits([0]), None)
        .build()
        .expect("valid template");
    let invoke = invoke_template();
    let mut callees = CalleeArena::new();
    let target = callees.intern("Foo.bar()V");

    let mut asm = TemplateStopsAssembler::new();
    if safepoint_first {
        asm.add_template(&check, 0, Some(3), None).unwrap();
        asm.add_template(&invoke, 4, Some(3), Some(target)).unwrap();
    } else {
        asm.add_template(&invoke, 0, Some(3), Some(target)).unwrap();
        asm.add_template(&check, 16, Some(3), None).unwrap();
    }
    let mut method = asm.finish(&layout().pack_config()).unwrap();

    let mut frames = RecordedFrames::new(layout());
    frames
        .record(
            3,
            FrameState {
                locals: BitMap::from_bits([1]),
                stack_depth: 2,
                stack_refs: BitMap::from_bits([0, 1]),
                popped_depth: Some(1),
            },
        )
        .unwrap();
    let report = ReferenceMapFinalizer::new(layout())
        .finalize(&mut method, &BlockStarts::new(vec![0]).unwrap(), &mut frames)
        .unwrap();
    (method, report)
}

#[test]
fn test_finalize_independent_of_stop_order() {
    for safepoint_first in [true, false] {
        let (method, report) = finalize_shared_bci(safepoint_first);
        let stops = &method.stops;
        assert_eq!(stops.len(), 3);

        // the direct region holds only the bytecode call
        assert!(stops.flags(0).is_bytecode_call());
        let call_bsm = stops.bsm_index(0);
        assert_eq!(call_bsm, if safepoint_first { 1 } else { 0 });
        assert_eq!(stops.frame_refs(0), vec![1, 2]);

        let mut safepoints: Vec<Vec<usize>> = (1..3).map(|i| stops.frame_refs(i)).collect();
        safepoints.sort();
        assert_eq!(safepoints, vec![vec![1, 2, 3, 5], vec![1, 2, 3, 6]]);

        assert_eq!(report.stops_visited, 3);
        // call 2 + each safepoint 3; template slots are set at pack
        assert_eq!(report.bits_set, 8);
        assert_eq!(report.redundant_marks, 0);
    }
}

#[test]
fn test_finalize_is_idempotent_on_bits() {
    let mut callees = CalleeArena::new();
    let mut method = assemble(&mut callees);

    let mut frames = RecordedFrames::new(layout());
    for bci in [0, 3, 6] {
        frames
            .record(
                bci,
                FrameState {
                    locals: BitMap::from_bits([1]),
                    popped_depth: Some(0),
                    ..FrameState::default()
                },
            )
            .unwrap();
    }
    let blocks = BlockStarts::from_flags(&[true, false, false, true, false, false, true]);
    let finalizer = ReferenceMapFinalizer::new(layout());

    let first = finalizer.finalize(&mut method, &blocks, &mut frames).unwrap();
    let second = finalizer.finalize(&mut method, &blocks, &mut frames).unwrap();
    assert_eq!(first.bits_set, 5);
    assert_eq!(second.bits_set, 0);
    assert_eq!(second.redundant_marks, first.bits_set);
}

#[test]
fn test_multiple_bytecode_calls_abort_template() {
    let err = TemplateBuilder::new("invokeinterface", 30)
        .direct_bytecode_call(10, 5)
        .indirect_bytecode_call(25, 20)
        .build()
        .unwrap_err();
    assert!(matches!(err, StopsError::MultipleBytecodeCalls { .. }));
}

#[test]
fn test_json_dump() {
    let mut callees = CalleeArena::new();
    let method = assemble(&mut callees);
    let json = serde_json::to_value(&method).unwrap();
    assert_eq!(json["map"]["first_stop_index"], 1);
    assert_eq!(json["stops"]["positions"].as_array().map(Vec::len), Some(6));
}
