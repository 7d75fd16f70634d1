//! Index from global symbol name to its exporting segment.
//!
//! Built by one full scan before matching starts and read-only afterwards,
//! so the matcher can query it freely (and, in a parallel setup, share it
//! across workers). Two objects exporting the same name is a corpus
//! problem, not ours: the first definition wins and the rest are reported.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

use log::warn;

use crate::omf::{Location, Object, Relocation, Segment};

/// Where a global symbol lives: the exporting object/segment and the
/// symbol's offset inside that segment.
pub struct ExportSite<'a> {
    pub object: &'a Object,
    pub location: Location,
    pub segment: &'a Segment,
    pub offset: u32,
}

pub struct ImportResolver<'a> {
    exports: HashMap<String, ExportSite<'a>>,
}

impl<'a> ImportResolver<'a> {
    /// Scan every segment's export table. Objects are visited in corpus
    /// order and export names in sorted order, so collision reporting and
    /// first-wins resolution are deterministic.
    pub fn build(objects: &'a [Object]) -> ImportResolver<'a> {
        let mut exports: HashMap<String, ExportSite<'a>> = HashMap::new();
        for object in objects {
            for (location, segment) in object.iter_segments() {
                let mut names: Vec<&String> = segment.exports.keys().collect();
                names.sort();
                for name in names {
                    let offset = segment.exports[name];
                    match exports.entry(name.clone()) {
                        Entry::Occupied(existing) => {
                            warn!(
                                "export collision: {}:{}:{}:{:?} is already defined in {:?}",
                                object.name,
                                location,
                                segment.name,
                                name,
                                existing.get().object.name
                            );
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(ExportSite {
                                object,
                                location,
                                segment,
                                offset,
                            });
                        }
                    }
                }
            }
        }
        ImportResolver { exports }
    }

    pub fn resolve(&self, name: &str) -> Option<&ExportSite<'a>> {
        self.exports.get(name)
    }

    /// Global names referenced by some relocation that nobody exports.
    /// Such relocations still constrain nothing during propagation.
    pub fn missing_imports(&self, objects: &[Object]) -> Vec<String> {
        let mut missing = BTreeSet::new();
        for object in objects {
            for (_, segment) in object.iter_segments() {
                for reloc in segment.relocs.values() {
                    if let Relocation::Global { name, .. } = reloc {
                        if !self.exports.contains_key(name) {
                            missing.insert(name.clone());
                        }
                    }
                }
            }
        }
        missing.into_iter().collect()
    }
}
