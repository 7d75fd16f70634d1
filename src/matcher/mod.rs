//! Matching pipeline: find where each parsed segment lives in the target.
//!
//! The matcher never re-links anything. It scans the target's bytes for
//! each segment, treating relocation sites as wildcards, and solves for
//! the addresses the linker must have used: `target = stored - addend`
//! (re-based for relative sites), all mod 2^32. Every accepted placement
//! carries the constraints it implies - which segments and which global
//! symbols must sit at which addresses - and placements are only kept if
//! those constraints survive propagation into every referenced segment.
//!
//! ## Module structure
//!
//! - `segment` - single-segment scan and the propagation closure
//! - `object` - per-object cross-join of segment candidate lists
//! - `imports` - global export index answering propagation queries
//! - `consolidate` - greedy merge of per-object results into one assignment
//!
//! The phases are strictly ordered: objects are matched independently
//! (the parsed object graph and the import index are read-only here), and
//! consolidation runs once afterwards.

mod consolidate;
mod imports;
mod object;
mod segment;

pub use consolidate::{consolidate, Consolidation, ObjectMatches};
pub use imports::{ExportSite, ImportResolver};

use std::collections::BTreeMap;
use std::fmt;

use crate::omf::{Location, Object};
use crate::pe::TargetImage;

/// Inclusive range of virtual addresses a back-computed target may fall
/// into. Anything outside rejects the placement outright.
#[derive(Debug, Clone, Copy)]
pub struct AddressWindow {
    pub low: u32,
    pub high: u32,
}

impl AddressWindow {
    /// The image's own address space: anything a linked reference points at
    /// must be mapped by the executable.
    pub fn of_image(image: &TargetImage) -> AddressWindow {
        AddressWindow {
            low: image.image_base,
            high: image
                .image_base
                .wrapping_add(image.size_of_image)
                .wrapping_sub(1),
        }
    }

    pub fn contains(self, address: u32) -> bool {
        self.low <= address && address <= self.high
    }
}

/// Fully qualified name of one segment of one object. Constraint maps are
/// keyed by this triple; `BTreeMap` ordering makes listings deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentKey {
    pub object: String,
    pub location: Location,
    pub segment: String,
}

impl SegmentKey {
    pub fn new(object: &str, location: Location, segment: &str) -> SegmentKey {
        SegmentKey {
            object: object.to_string(),
            location,
            segment: segment.to_string(),
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}:{:?}", self.object, self.location, self.segment)
    }
}

/// One possible placement: the segment and symbol addresses it forces.
/// Two candidates are the same placement iff both maps are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidate {
    pub locals: BTreeMap<SegmentKey, u32>,
    pub globals: BTreeMap<String, u32>,
}

impl Candidate {
    /// Information content: how many addresses this candidate pins down.
    pub fn weight(&self) -> usize {
        self.locals.len() + self.globals.len()
    }

    /// True if any shared key disagrees. Disjoint or agreeing maps are
    /// compatible.
    pub fn collides_with(&self, other: &Candidate) -> bool {
        self.locals
            .iter()
            .any(|(k, v)| other.locals.get(k).map_or(false, |o| o != v))
            || self
                .globals
                .iter()
                .any(|(k, v)| other.globals.get(k).map_or(false, |o| o != v))
    }

    /// Union the other candidate's constraints into this one. Only valid
    /// after a `collides_with` check.
    pub fn merge_from(&mut self, other: &Candidate) {
        for (k, v) in &other.locals {
            self.locals.insert(k.clone(), *v);
        }
        for (k, v) in &other.globals {
            self.globals.insert(k.clone(), *v);
        }
    }
}

/// Drop exact duplicates, keeping first occurrences in order.
pub(crate) fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut unique: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !unique.contains(&candidate) {
            unique.push(candidate);
        }
    }
    unique
}

/// Shared state for one matching run. Everything here is read-only; the
/// context can be shared across threads if objects are partitioned.
pub struct MatchContext<'a> {
    objects: &'a [Object],
    image: &'a TargetImage,
    resolver: &'a ImportResolver<'a>,
    window: AddressWindow,
}

impl<'a> MatchContext<'a> {
    pub fn new(
        objects: &'a [Object],
        image: &'a TargetImage,
        resolver: &'a ImportResolver<'a>,
        window: AddressWindow,
    ) -> MatchContext<'a> {
        MatchContext {
            objects,
            image,
            resolver,
            window,
        }
    }

    pub(crate) fn object_by_name(&self, name: &str) -> Option<&'a Object> {
        self.objects.iter().find(|o| o.name == name)
    }

    /// A location's image bytes, or an empty region based at 0 for
    /// locations the image does not map. Constraints into unmapped
    /// locations can then never pass the bounds check.
    pub(crate) fn section_or_empty(&self, location: Location) -> (u32, &'a [u8]) {
        let image: &'a TargetImage = self.image;
        image.section(location).unwrap_or((0, &[]))
    }
}
