//! Per-opcode code templates and their stop metadata
//!
//! A template is a fixed snippet of machine code. Its stops carry positions
//! relative to the template's own code start and reference maps over the
//! template's scratch slots only. At most one of its call stops is the
//! bytecode call: the call the instruction itself performs.

use serde::Serialize;

use crate::bitmap::BitMap;
use crate::callee::CalleeId;
use crate::error::{Result, StopsError};
use crate::stop::{StopFlags, StopKind};

/// A stop inside a template, positioned relative to the template start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateStop {
    /// Region and attribute flags
    pub flags: StopFlags,
    /// Offset of the stop within the template
    pub position: u32,
    /// Offset of the causing instruction within the template
    pub cause_position: u32,
    /// Runtime helper called by an in-template direct call
    pub callee: Option<CalleeId>,
    /// Template scratch slots holding references
    pub frame_ref_map: Option<BitMap>,
    /// Registers holding references (safepoints only)
    pub register_ref_map: Option<BitMap>,
}

impl TemplateStop {
    /// Check if this is the template's bytecode call slot
    pub fn is_bytecode_call(&self) -> bool {
        self.flags.is_bytecode_call()
    }
}

/// A code template with its stops in region order
#[derive(Debug, Clone, Serialize)]
pub struct Template {
    name: String,
    code_size: u32,
    stops: Vec<TemplateStop>,
}

impl Template {
    /// Template name, usually the opcode it implements
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the template's code in bytes
    pub fn code_size(&self) -> u32 {
        self.code_size
    }

    /// All stops, direct calls first, then indirect calls, then safepoints
    pub fn stops(&self) -> &[TemplateStop] {
        &self.stops
    }

    /// Stops of one region
    pub fn stops_of(&self, kind: StopKind) -> impl Iterator<Item = &TemplateStop> + '_ {
        self.stops.iter().filter(move |s| s.flags.kind() == Some(kind))
    }

    /// The bytecode call slot, if the template reserves one
    pub fn bytecode_call(&self) -> Option<&TemplateStop> {
        self.stops.iter().find(|s| s.is_bytecode_call())
    }

    /// Check if the bytecode call slot is a direct call needing a resolved callee
    pub fn has_direct_bytecode_call(&self) -> bool {
        self.bytecode_call()
            .is_some_and(|s| s.flags.contains(StopFlags::DIRECT_CALL))
    }
}

/// Builder for templates
#[derive(Debug)]
pub struct TemplateBuilder {
    name: String,
    code_size: u32,
    stops: Vec<TemplateStop>,
}

impl TemplateBuilder {
    /// Start a template of `code_size` bytes
    pub fn new(name: impl Into<String>, code_size: u32) -> Self {
        Self {
            name: name.into(),
            code_size,
            stops: Vec::new(),
        }
    }

    fn push(
        mut self,
        flags: StopFlags,
        position: u32,
        cause_position: u32,
        callee: Option<CalleeId>,
        frame_ref_map: Option<BitMap>,
    ) -> Self {
        self.stops.push(TemplateStop {
            flags,
            position,
            cause_position,
            callee,
            frame_ref_map,
            register_ref_map: None,
        });
        self
    }

    /// Direct call from template code to a runtime helper
    pub fn direct_call(
        self,
        position: u32,
        cause_position: u32,
        callee: CalleeId,
        frame_ref_map: BitMap,
    ) -> Self {
        let flags = StopFlags::DIRECT_CALL.union(StopFlags::IN_TEMPLATE);
        self.push(flags, position, cause_position, Some(callee), Some(frame_ref_map))
    }

    /// The instruction's own statically bound call
    pub fn direct_bytecode_call(self, position: u32, cause_position: u32) -> Self {
        self.push(StopFlags::DIRECT_CALL, position, cause_position, None, None)
    }

    /// Indirect call from template code
    pub fn indirect_call(self, position: u32, cause_position: u32, frame_ref_map: BitMap) -> Self {
        let flags = StopFlags::INDIRECT_CALL.union(StopFlags::IN_TEMPLATE);
        self.push(flags, position, cause_position, None, Some(frame_ref_map))
    }

    /// The instruction's own dispatched call (virtual or interface)
    pub fn indirect_bytecode_call(self, position: u32, cause_position: u32) -> Self {
        self.push(StopFlags::INDIRECT_CALL, position, cause_position, None, None)
    }

    /// Safepoint poll inside template code
    pub fn safepoint(
        mut self,
        position: u32,
        frame_ref_map: BitMap,
        register_ref_map: Option<BitMap>,
    ) -> Self {
        self.stops.push(TemplateStop {
            flags: StopFlags::SAFEPOINT.union(StopFlags::IN_TEMPLATE),
            position,
            cause_position: position,
            callee: None,
            frame_ref_map: Some(frame_ref_map),
            register_ref_map,
        });
        self
    }

    /// Validate the stops and order them by region
    pub fn build(mut self) -> Result<Template> {
        let mut bytecode_calls = 0;
        for stop in &self.stops {
            stop.flags.validate()?;
            if stop.position > self.code_size || stop.cause_position > stop.position {
                return Err(StopsError::TemplateStopOutOfRange {
                    template: self.name,
                    position: stop.position,
                    code_size: self.code_size,
                });
            }
            if stop.is_bytecode_call() {
                bytecode_calls += 1;
            }
        }
        if bytecode_calls > 1 {
            return Err(StopsError::MultipleBytecodeCalls {
                template: self.name,
            });
        }
        self.stops
            .sort_by_key(|s| s.flags.kind().map(StopKind::ordinal));
        Ok(Template {
            name: self.name,
            code_size: self.code_size,
            stops: self.stops,
        })
    }
}
