//! Combine one object's per-segment candidate lists into whole-object
//! candidates.
//!
//! Segments of one object were laid out together by the linker, so their
//! placements must agree on every shared constraint. The fold is a plain
//! cross-product with collision filtering: candidate sets stay small
//! because most segments pin each other down through relocations.

use crate::error::Result;
use crate::matcher::{dedup_candidates, Candidate, MatchContext};
use crate::omf::{Location, Object};

impl<'a> MatchContext<'a> {
    /// All consistent placements of an entire object. An empty result means
    /// some scannable segment matched nowhere (or no combination agreed);
    /// an object with nothing to scan yields one empty candidate.
    ///
    /// BSS is never scanned: its bytes are synthetic zeros that would match
    /// anywhere in the zero-filled BSS region. BSS segments are still
    /// placed, but only by propagation from segments that reference them.
    pub fn match_object(&self, object: &Object) -> Result<Vec<Candidate>> {
        let mut combined: Vec<Candidate> = Vec::new();
        let mut scanned_any = false;

        for location in Location::ALL {
            if location == Location::Bss {
                continue;
            }
            if self.image.section(location).is_none() {
                continue;
            }
            for segment in object.segments(location) {
                let Some(matches) = self.segment_candidates(object, location, segment)? else {
                    continue;
                };
                scanned_any = true;
                if matches.is_empty() {
                    return Ok(Vec::new());
                }

                combined = if combined.is_empty() {
                    matches
                } else {
                    let joined = cross_join(&combined, &matches);
                    if joined.is_empty() {
                        return Ok(Vec::new());
                    }
                    joined
                };
                combined = dedup_candidates(combined);
            }
        }

        if !scanned_any {
            return Ok(vec![Candidate::default()]);
        }
        Ok(combined)
    }
}

/// Every pairing of an accumulated candidate with a new segment's candidate
/// that agrees on all shared keys, merged.
fn cross_join(accumulated: &[Candidate], new: &[Candidate]) -> Vec<Candidate> {
    let mut joined = Vec::new();
    for addition in new {
        for previous in accumulated {
            if addition.collides_with(previous) {
                continue;
            }
            let mut merged = previous.clone();
            merged.merge_from(addition);
            joined.push(merged);
        }
    }
    joined
}
