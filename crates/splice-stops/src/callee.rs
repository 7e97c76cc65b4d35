//! Session-local callee interning
//!
//! Call targets are named by an opaque `CalleeId` that is only meaningful
//! within the `CalleeArena` of one compilation session.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::Serialize;

/// Opaque identifier of an interned call target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CalleeId(pub u32);

impl fmt::Display for CalleeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Interning arena for call targets owned by a compilation session
#[derive(Debug, Default)]
pub struct CalleeArena {
    names: Vec<String>,
    ids: FxHashMap<String, CalleeId>,
}

impl CalleeArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a call target by name, returning its stable id
    pub fn intern(&mut self, name: &str) -> CalleeId {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = CalleeId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    /// Look up an already interned call target
    pub fn get(&self, name: &str) -> Option<CalleeId> {
        self.ids.get(name).copied()
    }

    /// Name of an interned call target
    pub fn name(&self, id: CalleeId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    /// Number of interned call targets
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
