//! Stops: call sites and safepoints in generated code
//!
//! A stop records a code position at which the garbage collector or the
//! exception dispatcher may inspect the frame. Stops are partitioned into
//! three regions (direct calls, indirect calls, safepoints) selected by
//! their flags.

use std::fmt;

use serde::Serialize;

use crate::bitmap::BitMap;
use crate::callee::CalleeId;
use crate::error::{Result, StopsError};

/// Stop attribute flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StopFlags(u8);

impl StopFlags {
    /// No flags
    pub const NONE: Self = Self(0x00);
    /// Direct call with a statically known target
    pub const DIRECT_CALL: Self = Self(0x01);
    /// Indirect call through a register or memory operand
    pub const INDIRECT_CALL: Self = Self(0x02);
    /// Safepoint poll
    pub const SAFEPOINT: Self = Self(0x04);
    /// Safepoint polled at the source of a loop back-edge
    pub const BACKWARD_BRANCH: Self = Self(0x08);
    /// Stop belongs to template code rather than the bytecode's own call
    pub const IN_TEMPLATE: Self = Self(0x10);

    const REGION_MASK: u8 = 0x07;

    const NAMES: [(Self, &'static str); 5] = [
        (Self::DIRECT_CALL, "DIRECT_CALL"),
        (Self::INDIRECT_CALL, "INDIRECT_CALL"),
        (Self::SAFEPOINT, "SAFEPOINT"),
        (Self::BACKWARD_BRANCH, "BACKWARD_BRANCH"),
        (Self::IN_TEMPLATE, "IN_TEMPLATE"),
    ];

    /// Create from raw bits
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Get raw bits
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check if all flags of `other` are set
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union of flags
    pub const fn union(&self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Difference (remove flags)
    pub const fn difference(&self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// The region these flags select, if exactly one region bit is set
    pub fn kind(&self) -> Option<StopKind> {
        match self.0 & Self::REGION_MASK {
            0x01 => Some(StopKind::DirectCall),
            0x02 => Some(StopKind::IndirectCall),
            0x04 => Some(StopKind::Safepoint),
            _ => None,
        }
    }

    /// Check that the flags describe a well-formed stop
    ///
    /// Exactly one region bit must be set. `BACKWARD_BRANCH` only qualifies
    /// a safepoint and never one owned by a template.
    pub fn validate(&self) -> Result<StopKind> {
        let invalid = StopsError::InvalidStopFlags { flags: self.0 };
        if self.0 & !0x1F != 0 {
            return Err(invalid);
        }
        let kind = self.kind().ok_or(invalid.clone())?;
        if self.contains(Self::BACKWARD_BRANCH)
            && (kind != StopKind::Safepoint || self.contains(Self::IN_TEMPLATE))
        {
            return Err(invalid);
        }
        Ok(kind)
    }

    /// Check if this is a call stop (direct or indirect)
    pub fn is_call(&self) -> bool {
        self.0 & (Self::DIRECT_CALL.0 | Self::INDIRECT_CALL.0) != 0
    }

    /// Check if this is the call the bytecode instruction itself performs
    pub fn is_bytecode_call(&self) -> bool {
        self.is_call() && !self.contains(Self::IN_TEMPLATE)
    }
}

impl fmt::Debug for StopFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StopFlags({})", self)
    }
}

impl fmt::Display for StopFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// The region of the stop table a stop belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum StopKind {
    /// Call with a statically known target
    DirectCall,
    /// Call through a register or dispatch table
    IndirectCall,
    /// Safepoint poll
    Safepoint,
}

impl StopKind {
    /// All regions in table order
    pub const ALL: [StopKind; 3] = [
        StopKind::DirectCall,
        StopKind::IndirectCall,
        StopKind::Safepoint,
    ];

    /// Position of this region in table order
    pub fn ordinal(self) -> usize {
        match self {
            StopKind::DirectCall => 0,
            StopKind::IndirectCall => 1,
            StopKind::Safepoint => 2,
        }
    }

    /// The flag selecting this region
    pub fn flag(self) -> StopFlags {
        match self {
            StopKind::DirectCall => StopFlags::DIRECT_CALL,
            StopKind::IndirectCall => StopFlags::INDIRECT_CALL,
            StopKind::Safepoint => StopFlags::SAFEPOINT,
        }
    }
}

/// A single stop in a method's generated code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stop {
    /// Region and attribute flags
    pub flags: StopFlags,
    /// Byte offset of the stop (the return address for calls)
    pub position: u32,
    /// Byte offset of the instruction causing the stop
    pub cause_position: u32,
    /// Bytecode index that produced the stop, `None` for synthetic code
    pub bci: Option<u32>,
    /// Statically known target of a direct call
    pub callee: Option<CalleeId>,
    /// Frame slots holding references at this stop
    pub frame_ref_map: Option<BitMap>,
    /// Registers holding references at this stop (safepoints only)
    pub register_ref_map: Option<BitMap>,
}

impl Stop {
    /// Create a stop with no callee and no reference maps
    pub fn new(flags: StopFlags, position: u32, cause_position: u32, bci: Option<u32>) -> Self {
        Self {
            flags,
            position,
            cause_position,
            bci,
            callee: None,
            frame_ref_map: None,
            register_ref_map: None,
        }
    }

    /// The loop back-edge safepoint emitted for a backward branch at `bci`
    pub fn backward_branch(position: u32, bci: u32) -> Self {
        Self::new(
            StopFlags::SAFEPOINT.union(StopFlags::BACKWARD_BRANCH),
            position,
            position,
            Some(bci),
        )
    }

    /// Attach a direct call target
    pub fn with_callee(mut self, callee: CalleeId) -> Self {
        self.callee = Some(callee);
        self
    }

    /// Attach a frame reference map
    pub fn with_frame_ref_map(mut self, map: BitMap) -> Self {
        self.frame_ref_map = Some(map);
        self
    }

    /// Attach a register reference map
    pub fn with_register_ref_map(mut self, map: BitMap) -> Self {
        self.register_ref_map = Some(map);
        self
    }

    /// Region of this stop, if its flags are well formed
    pub fn kind(&self) -> Option<StopKind> {
        self.flags.kind()
    }
}

impl fmt::Display for Stop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.flags, self.position)?;
        if self.cause_position != self.position {
            write!(f, " (cause {})", self.cause_position)?;
        }
        match self.bci {
            Some(bci) => write!(f, " [bci: {}", bci)?,
            None => f.write_str(" [bci: -")?,
        }
        if let Some(callee) = self.callee {
            write!(f, ", callee: {}", callee)?;
        }
        if let Some(map) = &self.frame_ref_map {
            write!(f, ", frameRefMap: {}", map)?;
        }
        if let Some(map) = &self.register_ref_map {
            write!(f, ", regRefMap: {}", map)?;
        }
        f.write_str("]")
    }
}
