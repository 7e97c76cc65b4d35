//! `splice assemble` — Splice a method fixture and dump its stop metadata.

use std::path::PathBuf;

use serde::Serialize;
use splice_stops::{
    CalleeArena, CalleeId, FinalizeReport, PackedMethodStops, ReferenceMapFinalizer,
};

use crate::fixture::Fixture;
use crate::output::{resolve_color_choice, StyledOutput};

/// Arguments for the assemble command.
pub struct AssembleArgs {
    pub fixture: PathBuf,
    pub format: String,
    pub color: String,
}

/// Everything produced from one fixture
pub struct Assembled {
    pub callees: CalleeArena,
    pub method: PackedMethodStops,
    pub report: Option<FinalizeReport>,
}

#[derive(Serialize)]
struct Dump<'a> {
    callees: Vec<&'a str>,
    method: &'a PackedMethodStops,
    report: Option<FinalizeReport>,
}

pub fn execute(args: AssembleArgs) -> anyhow::Result<()> {
    let fixture = Fixture::load(&args.fixture)?;
    let assembled = assemble(&fixture)?;

    match args.format.as_str() {
        "json" => println!("{}", render_json(&assembled)?),
        "text" => print_text(&args, &assembled),
        other => anyhow::bail!("Unknown format '{}' (expected text or json)", other),
    }
    Ok(())
}

/// Assemble, pack and, when the fixture records frames, finalize
pub fn assemble(fixture: &Fixture) -> anyhow::Result<Assembled> {
    let mut callees = CalleeArena::new();
    let mut method = fixture.assemble(&mut callees)?;

    let report = match fixture.reference_frames()? {
        Some((blocks, mut frames)) => Some(
            ReferenceMapFinalizer::new(fixture.layout).finalize(&mut method, &blocks, &mut frames)?,
        ),
        None => None,
    };

    Ok(Assembled {
        callees,
        method,
        report,
    })
}

fn callee_names(callees: &CalleeArena) -> Vec<&str> {
    (0..callees.len() as u32)
        .filter_map(|i| callees.name(CalleeId(i)))
        .collect()
}

pub fn render_json(assembled: &Assembled) -> anyhow::Result<String> {
    let dump = Dump {
        callees: callee_names(&assembled.callees),
        method: &assembled.method,
        report: assembled.report,
    };
    Ok(serde_json::to_string_pretty(&dump)?)
}

fn print_text(args: &AssembleArgs, assembled: &Assembled) {
    let mut out = StyledOutput::new(resolve_color_choice(Some(&args.color)));

    out.heading(&format!("method {}", args.fixture.display()));
    out.newline();
    out.plain(&assembled.method.to_string());

    if !assembled.callees.is_empty() {
        out.heading("callees:");
        out.newline();
        for (i, name) in callee_names(&assembled.callees).into_iter().enumerate() {
            out.info(&format!("  {} {}", CalleeId(i as u32), name));
            out.newline();
        }
    }

    match assembled.report {
        Some(report) => {
            out.success("finalized");
            out.line(&format!(
                ": {} bcis, {} stops, {} bits set, {} redundant",
                report.bcis_visited, report.stops_visited, report.bits_set, report.redundant_marks
            ));
        }
        None => out.line("no frame states recorded; reference maps hold template slots only"),
    }
    out.flush();
}
