//! Merge per-object match results into one global assignment.
//!
//! Deliberately not an exhaustive search: the corpus always contains
//! enough objects with a unique, constraint-rich placement to anchor
//! everything else. Unique candidates are committed richest-first, then
//! ambiguous objects are filtered against the committed constraints and
//! committed only if exactly one of their candidates survives.

use crate::matcher::Candidate;

/// One object's surviving candidates after per-object matching.
pub struct ObjectMatches {
    pub object: String,
    pub candidates: Vec<Candidate>,
}

/// Result of consolidation: the committed assignment plus the objects left
/// ambiguous (name and number of surviving candidates).
pub struct Consolidation {
    pub combined: Candidate,
    pub ambiguous: Vec<(String, usize)>,
}

pub fn consolidate(matches: &[ObjectMatches]) -> Consolidation {
    let mut unique: Vec<(&str, &Candidate)> = Vec::new();
    let mut contested: Vec<(&str, &[Candidate])> = Vec::new();
    for m in matches {
        match m.candidates.len() {
            0 => {}
            1 => unique.push((&m.object, &m.candidates[0])),
            _ => contested.push((&m.object, &m.candidates)),
        }
    }

    // Richest candidate first: more keys means tighter constraints, so the
    // seed carries the most decisive anchor. Name order breaks ties to keep
    // runs reproducible.
    unique.sort_by(|a, b| {
        b.1.weight()
            .cmp(&a.1.weight())
            .then_with(|| a.0.cmp(b.0))
    });
    contested.sort_by(|a, b| a.0.cmp(b.0));

    let mut combined = Candidate::default();
    for (_, candidate) in &unique {
        if candidate.collides_with(&combined) {
            continue;
        }
        combined.merge_from(candidate);
    }

    let mut ambiguous = Vec::new();
    for (name, candidates) in contested {
        let surviving: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| !c.collides_with(&combined))
            .collect();
        match surviving.len() {
            0 => {}
            1 => combined.merge_from(surviving[0]),
            n => ambiguous.push((name.to_string(), n)),
        }
    }

    Consolidation { combined, ambiguous }
}
