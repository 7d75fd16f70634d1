//! Single-segment matching and the propagation closure.
//!
//! A segment matches at a position when every literal byte agrees and every
//! relocation site back-computes to a plausible address. Accepting a
//! position is not local, though: each back-computed address pins another
//! segment (or a global symbol's exporter) to a specific place, and the
//! placement only stands if those segments match there too. `propagate`
//! chases that chain to a fixed point.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::matcher::{dedup_candidates, Candidate, MatchContext, SegmentKey};
use crate::omf::record::read_u32;
use crate::omf::{Location, Object, Relocation, Segment};

impl<'a> MatchContext<'a> {
    /// All accepted placements of one segment inside its location's bytes.
    /// `Ok(None)` means the segment has no data to scan for (its exports
    /// are still reachable through the import resolver once something else
    /// places the object).
    pub(crate) fn segment_candidates(
        &self,
        object: &Object,
        location: Location,
        segment: &Segment,
    ) -> Result<Option<Vec<Candidate>>> {
        if segment.data.is_empty() {
            return Ok(None);
        }

        let (base, bytes) = self.section_or_empty(location);
        let mut candidates = Vec::new();
        if bytes.len() < segment.data.len() {
            return Ok(Some(candidates));
        }

        let key = SegmentKey::new(&object.name, location, &segment.name);

        // First byte not owned by a relocation, if any. Relocation bytes are
        // wildcards, so only a literal byte can anchor a fast search.
        let mut first_literal = segment.data.len();
        let mut j = 0;
        while j < segment.data.len() {
            match segment.relocs.get(&(j as u32)) {
                Some(reloc) => j += reloc.kind().size(),
                None => {
                    first_literal = j;
                    break;
                }
            }
        }

        let limit = bytes.len() - segment.data.len();
        let mut i = 0;
        while i <= limit {
            if first_literal != segment.data.len() {
                let anchor = segment.data[first_literal];
                match bytes[i + first_literal..].iter().position(|&b| b == anchor) {
                    Some(skip) => i += skip,
                    None => break,
                }
                if i > limit {
                    break;
                }
            }

            let mut candidate = Candidate::default();
            if self.try_place(&key, segment, &bytes[i..], base.wrapping_add(i as u32), &mut candidate)
                && self.propagate(&mut candidate)?
            {
                candidates.push(candidate);
            }
            i += 1;
        }

        Ok(Some(dedup_candidates(candidates)))
    }

    /// Attempt to place `segment` at `base` (whose bytes start at
    /// `section[0]`), folding the implied constraints into `candidate`.
    /// The candidate is untouched when the placement fails.
    pub(crate) fn try_place(
        &self,
        key: &SegmentKey,
        segment: &Segment,
        section: &[u8],
        base: u32,
        candidate: &mut Candidate,
    ) -> bool {
        let mut scratch = candidate.clone();
        if !self.match_bytes(segment, &key.object, section, base, &mut scratch) {
            return false;
        }

        // The placement itself is a constraint: a relocation elsewhere may
        // already have pinned this segment to a different address.
        if let Some(&previous) = scratch.locals.get(key) {
            if previous != base {
                return false;
            }
        }
        scratch.locals.insert(key.clone(), base);

        for (name, &offset) in &segment.exports {
            let address = base.wrapping_add(offset);
            if let Some(&previous) = scratch.globals.get(name) {
                if previous != address {
                    return false;
                }
            }
            scratch.globals.insert(name.clone(), address);
        }

        *candidate = scratch;
        true
    }

    /// Walk the segment against `section`: literal bytes must agree,
    /// relocation sites back-compute their target address and record it as
    /// a constraint. Newly computed constraints must agree with everything
    /// already in `candidate` and with each other.
    fn match_bytes(
        &self,
        segment: &Segment,
        object_name: &str,
        section: &[u8],
        base: u32,
        candidate: &mut Candidate,
    ) -> bool {
        if section.len() < segment.data.len() {
            return false;
        }

        let mut new_locals: Vec<(SegmentKey, u32)> = Vec::new();
        let mut new_globals: Vec<(String, u32)> = Vec::new();

        let mut j = 0;
        while j < segment.data.len() {
            let Some(reloc) = segment.relocs.get(&(j as u32)) else {
                if section[j] != segment.data[j] {
                    return false;
                }
                j += 1;
                continue;
            };

            // Solve for the address the linker used. The stored dword is
            // target + addend for absolute sites and target + addend -
            // (site address + 4) for relative ones; everything wraps.
            let stored = read_u32(section, j);
            let mut target = stored.wrapping_sub(reloc.addend());
            if reloc.kind().is_relative() {
                target = target
                    .wrapping_add(base)
                    .wrapping_add(j as u32)
                    .wrapping_add(4);
            }
            if !self.window.contains(target) {
                return false;
            }

            match reloc {
                Relocation::Local { target: reference, .. } => {
                    let key = SegmentKey::new(object_name, reference.location, &reference.name);
                    if let Some(&previous) = candidate.locals.get(&key) {
                        if previous != target {
                            return false;
                        }
                    } else {
                        if new_locals.iter().any(|(k, v)| *k == key && *v != target) {
                            return false;
                        }
                        new_locals.push((key, target));
                    }
                }
                Relocation::Global { name, .. } => {
                    if let Some(&previous) = candidate.globals.get(name) {
                        if previous != target {
                            return false;
                        }
                    } else {
                        if new_globals.iter().any(|(n, v)| n == name && *v != target) {
                            return false;
                        }
                        new_globals.push((name.clone(), target));
                    }
                }
            }

            j += reloc.kind().size();
        }

        candidate.locals.extend(new_locals);
        candidate.globals.extend(new_globals);
        true
    }

    /// Chase every constraint in the candidate to a fixed point: each
    /// pinned segment must itself match at its pinned address, and each
    /// pinned global must be consistent with its exporter's segment placed
    /// accordingly. Any failure rejects the whole candidate.
    pub(crate) fn propagate(&self, candidate: &mut Candidate) -> Result<bool> {
        let mut checked_locals: HashSet<SegmentKey> = HashSet::new();
        let mut checked_globals: HashSet<String> = HashSet::new();

        loop {
            let pending_locals: Vec<(SegmentKey, u32)> = candidate
                .locals
                .iter()
                .filter(|(k, _)| !checked_locals.contains(*k))
                .map(|(k, &v)| (k.clone(), v))
                .collect();
            let pending_globals: Vec<(String, u32)> = candidate
                .globals
                .iter()
                .filter(|(k, _)| !checked_globals.contains(k.as_str()))
                .map(|(k, &v)| (k.clone(), v))
                .collect();
            if pending_locals.is_empty() && pending_globals.is_empty() {
                return Ok(true);
            }

            for (key, address) in pending_locals {
                checked_locals.insert(key.clone());

                let (base, bytes) = self.section_or_empty(key.location);
                if address < base || address > base.wrapping_add(bytes.len() as u32) {
                    return Ok(false);
                }

                // Constraint keys are minted from parsed relocations, so a
                // dangling one is a parser bug, not a failed match.
                let object = self.object_by_name(&key.object).ok_or_else(|| {
                    Error::Internal(format!("constraint references unknown object {:?}", key.object))
                })?;
                let segment = object.segment(key.location, &key.segment).ok_or_else(|| {
                    Error::Internal(format!("missing dependent segment {}", key))
                })?;

                if !self.try_place(&key, segment, &bytes[(address - base) as usize..], address, candidate)
                {
                    return Ok(false);
                }
            }

            for (name, address) in pending_globals {
                checked_globals.insert(name.clone());

                // A global nobody exports cannot confirm or deny anything.
                let Some(site) = self.resolver.resolve(&name) else {
                    continue;
                };
                let segment_address = address.wrapping_sub(site.offset);
                let (base, bytes) = self.section_or_empty(site.location);
                if segment_address < base
                    || segment_address.wrapping_sub(base) >= bytes.len() as u32
                {
                    return Ok(false);
                }

                let key = SegmentKey::new(&site.object.name, site.location, &site.segment.name);
                if !self.try_place(
                    &key,
                    site.segment,
                    &bytes[(segment_address - base) as usize..],
                    segment_address,
                    candidate,
                ) {
                    return Ok(false);
                }
            }
        }
    }
}
