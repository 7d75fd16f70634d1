//! Run the whole pipeline: load inputs, index exports, match, consolidate,
//! print the assignment.
//!
//! Phases, in order:
//! 1. Read and parse every library (a parse failure is fatal)
//! 2. Build the export index; report collisions and missing imports
//! 3. Load the target executable into per-Location regions
//! 4. Match every object independently
//! 5. Consolidate per-object candidates into one assignment
//! 6. Print committed constraints to stdout, sorted
//!
//! Diagnostics go through the logger (stderr); stdout carries only the
//! final listing.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::matcher::{
    consolidate, AddressWindow, Candidate, ImportResolver, MatchContext, ObjectMatches,
};
use crate::omf;
use crate::omf::Location;
use crate::pe::TargetImage;

pub fn run(target: &Path, libraries: &[PathBuf]) -> Result<()> {
    let mut objects = Vec::new();
    for path in libraries {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let parsed = omf::parse(&data).with_context(|| format!("parsing {}", path.display()))?;
        info!("{}: {} objects", path.display(), parsed.len());
        objects.extend(parsed);
    }
    info!("{} objects parsed", objects.len());

    let resolver = ImportResolver::build(&objects);
    let missing = resolver.missing_imports(&objects);
    for name in &missing {
        warn!("missing import: {:?} is exported by no object", name);
    }
    info!("{} imports missing", missing.len());

    let exe_data =
        fs::read(target).with_context(|| format!("reading {}", target.display()))?;
    let image = TargetImage::from_pe(&exe_data)
        .with_context(|| format!("loading {}", target.display()))?;
    for location in [Location::Code, Location::Data, Location::Bss] {
        if let Some((base, bytes)) = image.section(location) {
            info!("{}: {:08x}: {} KiB", location, base, bytes.len() / 1024);
        }
    }

    let window = AddressWindow::of_image(&image);
    let context = MatchContext::new(&objects, &image, &resolver, window);

    let mut matches = Vec::new();
    for object in &objects {
        let candidates = context.match_object(object)?;
        if candidates.is_empty() {
            continue;
        }
        matches.push(ObjectMatches {
            object: object.name.clone(),
            candidates,
        });
    }

    let consolidation = consolidate(&matches);
    for (name, count) in &consolidation.ambiguous {
        warn!("{} placements survive for {:?}; committing none", count, name);
    }

    let stdout = io::stdout();
    write_assignment(&mut stdout.lock(), &consolidation.combined)?;
    Ok(())
}

/// One line per committed constraint, segments first, then globals, each
/// group in key order.
fn write_assignment(out: &mut impl Write, combined: &Candidate) -> io::Result<()> {
    for (key, address) in &combined.locals {
        writeln!(out, "{}: {:08x}", key, address)?;
    }
    for (name, address) in &combined.globals {
        writeln!(out, "{}: {:08x}", name, address)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::SegmentKey;

    #[test]
    fn test_assignment_listing_is_sorted_and_hex() {
        let mut combined = Candidate::default();
        combined
            .locals
            .insert(SegmentKey::new("b.obj", Location::Code, "_TEXT"), 0x402000);
        combined
            .locals
            .insert(SegmentKey::new("a.obj", Location::Code, "_TEXT"), 0x401000);
        combined.globals.insert("main_".to_string(), 0x401010);
        combined.globals.insert("exit_".to_string(), 0x402040);

        let mut out = Vec::new();
        write_assignment(&mut out, &combined).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "\"a.obj\":CODE:\"_TEXT\": 00401000\n\
             \"b.obj\":CODE:\"_TEXT\": 00402000\n\
             exit_: 00402040\n\
             main_: 00401010\n"
        );
    }
}
