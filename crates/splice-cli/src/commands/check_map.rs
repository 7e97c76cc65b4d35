//! `splice check-map` — Validate a raw bytecode index map encoding.

use splice_stops::BytecodeIndexMap;

use crate::output::{resolve_color_choice, StyledOutput};

pub fn execute(encoding: Vec<u32>, first: u32, color: &str) -> anyhow::Result<()> {
    let mut out = StyledOutput::new(resolve_color_choice(Some(color)));

    let map = match BytecodeIndexMap::from_encoding(encoding, first) {
        Ok(map) => map,
        Err(e) => {
            out.error("invalid");
            out.line(&format!(": {}", e));
            out.flush();
            return Err(e.into());
        }
    };

    out.success("valid");
    out.line(&format!(
        ": {} entries, stops {}..{}",
        map.num_entries(),
        map.first_stop_index(),
        map.total_stops()
    ));
    for line in describe(&map) {
        out.line(&line);
    }
    out.flush();
    Ok(())
}

/// Canonical traversal rendered one line per bci
pub fn describe(map: &BytecodeIndexMap) -> Vec<String> {
    let mut lines = Vec::with_capacity(map.num_entries());
    let mut iter = map.iter();
    iter.reset();
    while let Some(bci) = iter.bci() {
        let mut stops = Vec::new();
        let mut next = iter.next_stop_index(true);
        while let Some(index) = next {
            stops.push(index.to_string());
            next = iter.next_stop_index(false);
        }
        lines.push(format!("  bci {:4}: {{{}}}", bci, stops.join(", ")));
        iter.advance();
    }
    lines
}
