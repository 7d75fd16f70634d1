//! The normalized object model produced by the OMF parser.
//!
//! One `Object` per library member, holding per-Location ordered segment
//! lists. After parsing, the model is read-only: the matcher shares it
//! freely. Cross-segment references are carried as `SegmentRef` values
//! (location + name + offset) rather than pointers, so the graph stays
//! acyclic even when segments reference each other both ways.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// Broad class of a segment, derived from its SEGDEF class name. Chooses
/// which region of the target image a segment is searched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Location {
    Code,
    BegData,
    Data,
    Bss,
    Const,
    Stack,
}

impl Location {
    pub const COUNT: usize = 6;

    pub const ALL: [Location; Location::COUNT] = [
        Location::Code,
        Location::BegData,
        Location::Data,
        Location::Bss,
        Location::Const,
        Location::Stack,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Map a SEGDEF class name to a Location. Class names outside the six
    /// known ones abort the parse: an unclassifiable segment could never be
    /// searched anywhere.
    pub fn from_class_name(name: &str) -> Result<Location> {
        match name {
            "CODE" => Ok(Location::Code),
            "BEGDATA" => Ok(Location::BegData),
            "DATA" => Ok(Location::Data),
            "BSS" => Ok(Location::Bss),
            "CONST" => Ok(Location::Const),
            "STACK" => Ok(Location::Stack),
            _ => Err(Error::UnknownSegmentClass(name.to_string())),
        }
    }

    pub fn class_name(self) -> &'static str {
        match self {
            Location::Code => "CODE",
            Location::BegData => "BEGDATA",
            Location::Data => "DATA",
            Location::Bss => "BSS",
            Location::Const => "CONST",
            Location::Stack => "STACK",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// A fully qualified point inside a named segment of the containing object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRef {
    pub location: Location,
    pub name: String,
    pub offset: u32,
}

impl fmt::Display for SegmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}:{:08x}", self.location, self.name, self.offset)
    }
}

/// The two byte widths a fixup can patch. The 48-bit pointer is a 32-bit
/// offset followed by a 16-bit selector; the selector carries no matching
/// information but still occupies two bytes of segment data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    Absolute32,
    Relative32,
    Absolute48,
}

impl RelocationKind {
    /// Number of segment-data bytes covered by a relocation site.
    pub fn size(self) -> usize {
        match self {
            RelocationKind::Absolute48 => 6,
            _ => 4,
        }
    }

    pub fn is_relative(self) -> bool {
        self == RelocationKind::Relative32
    }
}

impl fmt::Display for RelocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocationKind::Absolute32 => f.write_str("absolute 32-bit"),
            RelocationKind::Relative32 => f.write_str("relative 32-bit"),
            RelocationKind::Absolute48 => f.write_str("absolute 48-bit"),
        }
    }
}

/// A normalized fixup. The addend originally stored at the fixup site has
/// been extracted into the relocation and the site zeroed in segment data,
/// so matchers never consult data bytes under a relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relocation {
    /// Target lies within the same object; `target.offset` carries the
    /// addend.
    Local {
        kind: RelocationKind,
        target: SegmentRef,
    },
    /// Target is an external symbol resolved across objects.
    Global {
        kind: RelocationKind,
        name: String,
        addend: u32,
    },
}

impl Relocation {
    pub fn kind(&self) -> RelocationKind {
        match self {
            Relocation::Local { kind, .. } => *kind,
            Relocation::Global { kind, .. } => *kind,
        }
    }

    /// The displacement carried by the relocation, whichever variant.
    pub fn addend(&self) -> u32 {
        match self {
            Relocation::Local { target, .. } => target.offset,
            Relocation::Global { addend, .. } => *addend,
        }
    }
}

/// One named segment: declared-size data (uninitialized bytes zero),
/// relocations keyed by byte offset, and public exports keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub data: Vec<u8>,
    pub relocs: HashMap<u32, Relocation>,
    pub exports: HashMap<String, u32>,
}

impl Segment {
    /// Empty along all three axes; such segments are dropped after parsing.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.relocs.is_empty() && self.exports.is_empty()
    }
}

/// One object module: a name and per-Location segment lists in SEGDEF
/// declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Object {
    pub name: String,
    segments: [Vec<Segment>; Location::COUNT],
}

impl Object {
    pub fn new(name: impl Into<String>) -> Object {
        Object {
            name: name.into(),
            segments: Default::default(),
        }
    }

    pub fn segments(&self, location: Location) -> &[Segment] {
        &self.segments[location.index()]
    }

    pub fn push_segment(&mut self, location: Location, segment: Segment) {
        self.segments[location.index()].push(segment);
    }

    pub(crate) fn segments_mut(&mut self, location: Location) -> &mut Vec<Segment> {
        &mut self.segments[location.index()]
    }

    /// First segment with the given name in a location. Segment references
    /// travel as (location, name) values; this is where they resolve.
    pub fn segment(&self, location: Location, name: &str) -> Option<&Segment> {
        self.segments[location.index()].iter().find(|s| s.name == name)
    }

    pub(crate) fn segment_mut(&mut self, location: Location, slot: usize) -> &mut Segment {
        &mut self.segments[location.index()][slot]
    }

    /// All segments with their locations, in location then declaration order.
    pub fn iter_segments(&self) -> impl Iterator<Item = (Location, &Segment)> {
        Location::ALL
            .iter()
            .flat_map(move |&loc| self.segments(loc).iter().map(move |s| (loc, s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_class_names_round_trip() {
        for loc in Location::ALL {
            assert_eq!(Location::from_class_name(loc.class_name()).unwrap(), loc);
        }
    }

    #[test]
    fn test_unknown_class_is_an_error() {
        assert!(matches!(
            Location::from_class_name("FARDATA"),
            Err(Error::UnknownSegmentClass(_))
        ));
    }

    #[test]
    fn test_relocation_sizes() {
        assert_eq!(RelocationKind::Absolute32.size(), 4);
        assert_eq!(RelocationKind::Relative32.size(), 4);
        assert_eq!(RelocationKind::Absolute48.size(), 6);
        assert!(RelocationKind::Relative32.is_relative());
        assert!(!RelocationKind::Absolute32.is_relative());
        assert!(!RelocationKind::Absolute48.is_relative());
    }

    #[test]
    fn test_segment_ref_equality_is_three_way() {
        let a = SegmentRef {
            location: Location::Code,
            name: "_TEXT".to_string(),
            offset: 4,
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.offset = 8;
        assert_ne!(a, b);
        b.offset = 4;
        b.location = Location::Data;
        assert_ne!(a, b);
    }

    #[test]
    fn test_relocation_addend_accessor() {
        let local = Relocation::Local {
            kind: RelocationKind::Absolute32,
            target: SegmentRef {
                location: Location::Data,
                name: "_DATA".to_string(),
                offset: 0x10,
            },
        };
        assert_eq!(local.addend(), 0x10);
        let global = Relocation::Global {
            kind: RelocationKind::Relative32,
            name: "foo_".to_string(),
            addend: 0x20,
        };
        assert_eq!(global.addend(), 0x20);
    }

    #[test]
    fn test_segment_lookup_takes_first_match() {
        let mut object = Object::new("dup.obj");
        let mut first = Segment {
            name: "_TEXT".to_string(),
            ..Segment::default()
        };
        first.data = vec![1];
        let mut second = first.clone();
        second.data = vec![2];
        object.push_segment(Location::Code, first);
        object.push_segment(Location::Code, second);
        assert_eq!(object.segment(Location::Code, "_TEXT").unwrap().data, vec![1]);
    }
}
