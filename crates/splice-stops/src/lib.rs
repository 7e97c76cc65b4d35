//! Splice stop metadata
//!
//! This crate models the metadata a template-based baseline JIT records for
//! the machine code it stitches together from precompiled templates:
//! - **Stops**: call sites and safepoints, with frame and register reference maps
//! - **Stop tables**: append-only builders packed into an immutable, region-ordered form
//! - **Bytecode index maps**: compact `(bci, stop count)` encodings and their cursor
//! - **Template splicing**: re-basing per-template stops into a method-level table
//! - **Reference-map finalization**: filling in local and operand-stack liveness
//!   from a block-level reference interpreter
//!
//! # Example
//!
//! ```rust,ignore
//! use splice_stops::{CalleeArena, FrameLayout, TemplateBuilder, TemplateStopsAssembler};
//!
//! let mut callees = CalleeArena::new();
//! let invoke = TemplateBuilder::new("invokestatic", 16)
//!     .direct_bytecode_call(9, 4)
//!     .build()?;
//!
//! let mut asm = TemplateStopsAssembler::new();
//! asm.add_template(&invoke, 0, Some(0), Some(callees.intern("Foo.bar()V")))?;
//! let packed = asm.finish(&FrameLayout::new(2, 2, 1, 16).pack_config())?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod assembler;
pub mod bitmap;
pub mod bsm;
pub mod callee;
pub mod error;
pub mod frame;
pub mod refmap;
pub mod stop;
pub mod table;
pub mod template;

pub use assembler::{CalleeResolver, PackedMethodStops, TemplateStopsAssembler};
pub use bitmap::BitMap;
pub use bsm::{BciCursor, BytecodeIndexMap, BytecodeIndexMapBuilder, BytecodeIndexMapIterator};
pub use callee::{CalleeArena, CalleeId};
pub use error::{Result, StopsError};
pub use frame::FrameLayout;
pub use refmap::{
    BlockStarts, FinalizeReport, FrameState, RecordedFrames, ReferenceMapFinalizer,
    RefSlotWalk, ReferenceMapInterpreter, ReferenceSlotVisitor,
};
pub use stop::{Stop, StopFlags, StopKind};
pub use table::{DirectCallee, PackConfig, PackedStops, StopTableBuilder};
pub use template::{Template, TemplateBuilder, TemplateStop};
