//! Errors raised while building, packing and finalizing stop metadata
//!
//! Every variant is an internal-consistency failure: the method being compiled
//! must be abandoned. None of them is retryable.

/// Stop metadata errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StopsError {
    /// Bytecode indices in a map must strictly increase
    #[error("Bytecode index {bci} does not follow previous index {prev}")]
    NonIncreasingBci {
        /// Bci of the preceding entry
        prev: u32,
        /// Offending bci
        bci: u32,
    },

    /// A raw map encoding must hold whole `(bci, count)` pairs
    #[error("Bytecode index map has odd length {0}")]
    OddLength(usize),

    /// A template reserves at most one bytecode call slot
    #[error("Template '{template}' reserves more than one bytecode call slot")]
    MultipleBytecodeCalls {
        /// Template name
        template: String,
    },

    /// A direct bytecode call slot was spliced without a resolved callee
    #[error("Direct bytecode call of template '{template}' at bci {bci} has no resolved callee")]
    UnresolvedBytecodeCall {
        /// Template name
        template: String,
        /// Bci the template was spliced for
        bci: u32,
    },

    /// A callee was supplied for a template with no direct bytecode call slot
    #[error("Template '{template}' has no direct bytecode call slot to bind a callee to")]
    UnexpectedCallee {
        /// Template name
        template: String,
    },

    /// Stop flags must select exactly one region
    #[error("Invalid stop flags {flags:#04x}")]
    InvalidStopFlags {
        /// Raw flag bits
        flags: u8,
    },

    /// A template stop lies outside the template's code
    #[error("Stop at {position} lies outside template '{template}' of size {code_size}")]
    TemplateStopOutOfRange {
        /// Template name
        template: String,
        /// Stop position relative to the template
        position: u32,
        /// Template code size
        code_size: u32,
    },

    /// An in-template stop reached packing without liveness data
    #[error("In-template stop {index} at position {position} has no frame reference map")]
    MissingFrameRefMap {
        /// Stop index in emission order
        index: usize,
        /// Stop position
        position: u32,
    },

    /// Every direct call in a packed table needs a target
    #[error("Direct call stop {index} at position {position} has no callee")]
    MissingCallee {
        /// Stop index in emission order
        index: usize,
        /// Stop position
        position: u32,
    },

    /// Register maps are only recorded at safepoints
    #[error("Call stop {index} at position {position} carries a register reference map")]
    RegisterMapOnCall {
        /// Stop index in emission order
        index: usize,
        /// Stop position
        position: u32,
    },

    /// A reference map bit does not fit the packed map width
    #[error("Bit {bit} out of range for reference map of {width} bits (stop {index})")]
    BitOutOfRange {
        /// Stop index
        index: usize,
        /// Offending bit
        bit: usize,
        /// Map width in bits
        width: usize,
    },

    /// The map and the stop table disagree on the number of stops
    #[error("Stop count mismatch: map accounts for {mapped} stops, table holds {actual}")]
    StopCountMismatch {
        /// Stops accounted for by the map
        mapped: usize,
        /// Stops held by the table
        actual: usize,
    },

    /// A stop reached through a map entry belongs to another bytecode
    #[error("Stop {index} has bci {actual:?} but map entry expects bci {expected}")]
    BciMismatch {
        /// Stop table index
        index: usize,
        /// Bci of the map entry
        expected: u32,
        /// Bci recorded on the stop
        actual: Option<u32>,
    },

    /// Packing stops requires a non-empty frame reference map
    #[error("Frame reference map width must be non-zero when packing {stops} stops")]
    EmptyFrameMap {
        /// Number of stops being packed
        stops: usize,
    },

    /// A recorded frame state does not fit the frame layout
    #[error("Frame state at bci {bci} does not fit the frame layout: {detail}")]
    FrameStateOutOfRange {
        /// Bci of the frame state
        bci: u32,
        /// What does not fit
        detail: String,
    },

    /// Stop indices of a map must fit in `u32`
    #[error("Stop indices overflow: {first} unmapped plus {mapped} mapped stops exceed u32::MAX")]
    StopIndexOverflow {
        /// Unmapped stops preceding the first entry
        first: u32,
        /// Sum of entry stop counts
        mapped: u64,
    },
}

/// Result alias for stop metadata operations
pub type Result<T> = std::result::Result<T, StopsError>;
