//! Baseline frame layout
//!
//! Frame reference-map bits are numbered from the frame's logical slot 0:
//!
//! ```text
//! [ locals (max_locals) | operand stack (max_stack) | template slots ]
//! ```
//!
//! Template-local slot `k` lives at bit `template_slot_base() + k`.

use serde::{Deserialize, Serialize};

use crate::table::PackConfig;

/// Slot geometry of one method's baseline frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    /// Local variable slots
    pub max_locals: usize,
    /// Operand stack slots
    pub max_stack: usize,
    /// Scratch slots reserved for template code
    #[serde(default)]
    pub template_slots: usize,
    /// Registers covered by safepoint register maps
    #[serde(default = "default_register_map_bits")]
    pub register_map_bits: usize,
}

fn default_register_map_bits() -> usize {
    16
}

impl FrameLayout {
    /// Create a frame layout
    pub fn new(
        max_locals: usize,
        max_stack: usize,
        template_slots: usize,
        register_map_bits: usize,
    ) -> Self {
        Self {
            max_locals,
            max_stack,
            template_slots,
            register_map_bits,
        }
    }

    /// Frame bit of local variable `index`
    pub fn local_bit(&self, index: usize) -> usize {
        index
    }

    /// Frame bit of operand stack slot `index` (0 is the bottom of the stack)
    pub fn stack_bit(&self, index: usize) -> usize {
        self.max_locals + index
    }

    /// Frame bit of template-local slot 0
    pub fn template_slot_base(&self) -> usize {
        self.max_locals + self.max_stack
    }

    /// Width of the frame reference map in bits
    pub fn frame_map_bits(&self) -> usize {
        self.template_slot_base() + self.template_slots
    }

    /// Packing parameters for stops in a frame of this layout
    pub fn pack_config(&self) -> PackConfig {
        PackConfig {
            frame_map_bits: self.frame_map_bits(),
            register_map_bits: self.register_map_bits,
            template_slot_base: self.template_slot_base(),
        }
    }
}
