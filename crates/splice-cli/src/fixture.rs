//! Method fixtures
//!
//! A fixture describes one method as a TOML document: its frame layout,
//! the templates it is stitched from, the instruction sequence, and
//! optionally the recorded frame states used for reference-map
//! finalization.
//!
//! ```toml
//! blocks = [0, 3]
//!
//! [layout]
//! max_locals = 2
//! max_stack = 3
//! template_slots = 2
//!
//! [[templates]]
//! name = "invokestatic"
//! code_size = 16
//! stops = [
//!     { kind = "direct_bytecode_call", position = 8, cause = 3 },
//!     { kind = "safepoint", position = 12, frame_refs = [1] },
//! ]
//!
//! [[instructions]]
//! bci = 0
//! template = "invokestatic"
//! callee = "Foo.bar()V"
//!
//! [[frames]]
//! bci = 0
//! locals = [0]
//! ```

use std::path::Path;

use anyhow::Context;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use splice_stops::{
    BitMap, BlockStarts, CalleeArena, FrameLayout, FrameState, PackedMethodStops, RecordedFrames,
    StopsError, Template, TemplateBuilder, TemplateStopsAssembler,
};
use tracing::debug;

/// Fixture errors
#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("Unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("Runtime call at {position} in template '{template}' names no callee")]
    MissingRuntimeCallee { template: String, position: u32 },

    #[error("Instruction {index}: {reason}")]
    InvalidInstruction { index: usize, reason: &'static str },

    #[error(transparent)]
    Stops(#[from] StopsError),
}

fn default_backward_branch_size() -> u32 {
    4
}

/// A method fixture
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fixture {
    pub layout: FrameLayout,
    #[serde(default = "default_backward_branch_size")]
    pub backward_branch_size: u32,
    #[serde(default)]
    pub blocks: Vec<u32>,
    #[serde(default)]
    pub templates: Vec<TemplateSpec>,
    #[serde(default)]
    pub instructions: Vec<InstructionSpec>,
    #[serde(default)]
    pub frames: Vec<FrameSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateSpec {
    pub name: String,
    pub code_size: u32,
    #[serde(default)]
    pub stops: Vec<StopSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSpecKind {
    DirectCall,
    DirectBytecodeCall,
    IndirectCall,
    IndirectBytecodeCall,
    Safepoint,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StopSpec {
    pub kind: StopSpecKind,
    pub position: u32,
    pub cause: Option<u32>,
    pub callee: Option<String>,
    #[serde(default)]
    pub frame_refs: Vec<usize>,
    pub register_refs: Option<Vec<usize>>,
}

/// One emitted instruction: a template, or a loop back-edge poll
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstructionSpec {
    pub bci: Option<u32>,
    pub template: Option<String>,
    pub callee: Option<String>,
    #[serde(default)]
    pub backward_branch: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameSpec {
    pub bci: u32,
    #[serde(default)]
    pub locals: Vec<usize>,
    #[serde(default)]
    pub stack_depth: u32,
    #[serde(default)]
    pub stack_refs: Vec<usize>,
    pub popped_depth: Option<u32>,
}

impl Fixture {
    /// Read and parse a fixture file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse a fixture from TOML text
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Build every template, interning runtime callees in `callees`
    pub fn templates(
        &self,
        callees: &mut CalleeArena,
    ) -> Result<FxHashMap<String, Template>, FixtureError> {
        let mut templates = FxHashMap::default();
        for spec in &self.templates {
            let mut builder = TemplateBuilder::new(spec.name.as_str(), spec.code_size);
            for stop in &spec.stops {
                let cause = stop.cause.unwrap_or(stop.position);
                let frame = BitMap::from_bits(stop.frame_refs.iter().copied());
                builder = match stop.kind {
                    StopSpecKind::DirectCall => {
                        let name = stop.callee.as_deref().ok_or_else(|| {
                            FixtureError::MissingRuntimeCallee {
                                template: spec.name.clone(),
                                position: stop.position,
                            }
                        })?;
                        builder.direct_call(stop.position, cause, callees.intern(name), frame)
                    }
                    StopSpecKind::DirectBytecodeCall => {
                        builder.direct_bytecode_call(stop.position, cause)
                    }
                    StopSpecKind::IndirectCall => builder.indirect_call(stop.position, cause, frame),
                    StopSpecKind::IndirectBytecodeCall => {
                        builder.indirect_bytecode_call(stop.position, cause)
                    }
                    StopSpecKind::Safepoint => builder.safepoint(
                        stop.position,
                        frame,
                        stop
                            .register_refs
                            .as_ref()
                            .map(|r| BitMap::from_bits(r.iter().copied())),
                    ),
                };
            }
            templates.insert(spec.name.clone(), builder.build()?);
        }
        Ok(templates)
    }

    /// Splice the instruction sequence and pack the method's stops
    pub fn assemble(&self, callees: &mut CalleeArena) -> Result<PackedMethodStops, FixtureError> {
        let templates = self.templates(callees)?;
        let mut asm = TemplateStopsAssembler::new();
        let mut pos = 0;

        for (index, insn) in self.instructions.iter().enumerate() {
            let invalid = |reason| FixtureError::InvalidInstruction { index, reason };
            if insn.backward_branch {
                if insn.template.is_some() || insn.callee.is_some() {
                    return Err(invalid("a backward branch takes no template or callee"));
                }
                let bci = insn.bci.ok_or_else(|| invalid("a backward branch needs a bci"))?;
                asm.add_backward_branch(bci, pos)?;
                pos += self.backward_branch_size;
                continue;
            }

            let name = insn
                .template
                .as_deref()
                .ok_or_else(|| invalid("expected a template or backward_branch"))?;
            let template = templates
                .get(name)
                .ok_or_else(|| FixtureError::UnknownTemplate(name.to_string()))?;
            let callee = insn.callee.as_deref().map(|c| callees.intern(c));
            asm.add_template(template, pos, insn.bci, callee)?;
            pos += template.code_size();
        }

        debug!(code_size = pos, instructions = self.instructions.len(), "assembled fixture");
        Ok(asm.finish(&self.layout.pack_config())?)
    }

    /// Block starts and recorded frame states, if the fixture has any frames
    pub fn reference_frames(&self) -> Result<Option<(BlockStarts, RecordedFrames)>, FixtureError> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        let blocks = if self.blocks.is_empty() {
            BlockStarts::new(vec![0])?
        } else {
            BlockStarts::new(self.blocks.clone())?
        };
        let mut frames = RecordedFrames::new(self.layout);
        for spec in &self.frames {
            let state = FrameState {
                locals: BitMap::from_bits(spec.locals.iter().copied()),
                stack_depth: spec.stack_depth,
                stack_refs: BitMap::from_bits(spec.stack_refs.iter().copied()),
                popped_depth: spec.popped_depth,
            };
            frames.record(spec.bci, state)?;
        }
        Ok(Some((blocks, frames)))
    }
}
