//! Per-object OMF record parsing.
//!
//! Walks the tag/length/checksum record stream of one object module and
//! builds the normalized `Object`. Fixups are rewritten on the spot: the
//! dword stored at each fixup site becomes the relocation's addend and the
//! site is zeroed in segment data, so downstream code never has to know
//! what the toolchain left there. Three post-processing passes then resolve
//! local externs, undo intra-object globalization, and drop segments that
//! carry nothing.
//!
//! Record tags outside the recognized set are hard errors: an unknown
//! record length cannot be trusted to skip safely, and a library with one
//! unreadable object is not usable as matching input.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::omf::record::{read_u16, read_u32, RecordReader};
use crate::omf::types::{Location, Object, Relocation, RelocationKind, Segment, SegmentRef};

// ── Record tags ──────────────────────────────────────────────────────────────

const THEADR: u8 = 0x80;
const COMENT: u8 = 0x88;
const MODEND: u8 = 0x8a;
const EXTDEF: u8 = 0x8c;
const PUBDEF: u8 = 0x90;
const PUBDEF32: u8 = 0x91;
const LINNUM32: u8 = 0x95;
const LNAMES: u8 = 0x96;
const SEGDEF32: u8 = 0x99;
const GRPDEF: u8 = 0x9a;
const FIXUPP32: u8 = 0x9d;
const LEDATA: u8 = 0xa0;
const LEDATA32: u8 = 0xa1;
const LIDATA32: u8 = 0xa3;
const LEXTDEF: u8 = 0xb4;
const LPUBDEF: u8 = 0xb6;
const LPUBDEF32: u8 = 0xb7;

// ── FIXUPP32 field values ────────────────────────────────────────────────────

const FRAME_SEGMENT: u8 = 0;
const FRAME_GROUP: u8 = 1;
const FRAME_EXTERNAL: u8 = 2;
const FRAME_NUMBER: u8 = 3;
const FRAME_PREVIOUS: u8 = 4;
const FRAME_TARGET: u8 = 5;

const TARGET_SEGMENT: u8 = 0;
const TARGET_GROUP: u8 = 1;
const TARGET_EXTERNAL: u8 = 2;

const FIXUP_CLASS_OFFSET32: u8 = 9;
const FIXUP_CLASS_POINTER48: u8 = 11;

/// A SEGDEF as declared, before data arrives. `slot` is the segment's
/// position inside the object's per-location list; records that reference
/// segments by SEGDEF index resolve through this table.
struct SegmentDef {
    location: Location,
    name: String,
    slot: usize,
}

struct ExternDef {
    name: String,
    local: bool,
}

/// A fixup against a local (LEXTDEF) extern, parked until the object's
/// local exports are all known.
struct DeferredLocal {
    def_index: usize,
    site: u32,
    kind: RelocationKind,
    name: String,
    addend: u32,
}

/// Parse one object module starting at `data[0]`. Returns the object and
/// the number of bytes consumed up to and including the MODEND record.
pub(crate) fn parse_object(data: &[u8]) -> Result<(Object, usize)> {
    let mut object = Object::new("");

    let mut lnames: Vec<String> = Vec::new();
    let mut defs: Vec<SegmentDef> = Vec::new();
    let mut externs: Vec<ExternDef> = Vec::new();
    let mut local_exports: HashMap<String, SegmentRef> = HashMap::new();
    let mut global_exports: HashMap<String, SegmentRef> = HashMap::new();
    let mut deferred: Vec<DeferredLocal> = Vec::new();

    // (SEGDEF index, data offset) of the most recent LEDATA/LIDATA; fixups
    // are always relative to it.
    let mut last_data: Option<(usize, u32)> = None;

    let mut pos = 0;
    loop {
        if pos + 3 > data.len() {
            return Err(Error::Truncated("object record header"));
        }
        let tag = data[pos];
        let size = read_u16(data, pos + 1) as usize;
        if size == 0 {
            return Err(Error::Truncated("object record length"));
        }
        let record_end = pos + 3 + size;
        if record_end > data.len() {
            return Err(Error::Truncated("object record body"));
        }

        // A zero trailer opts out of checksumming; otherwise the whole
        // record, trailer included, sums to zero mod 256.
        if data[record_end - 1] != 0 {
            let sum = data[pos..record_end]
                .iter()
                .fold(0u8, |acc, &b| acc.wrapping_add(b));
            if sum != 0 {
                return Err(Error::ChecksumFailed(pos));
            }
        }

        let content = &data[pos + 3..record_end - 1];
        let record_offset = pos;
        pos = record_end;

        let mut r = RecordReader::new(content);
        match tag {
            THEADR => {
                object.name = r.read_string("THEADR name")?;
            }
            MODEND => break,
            COMENT | LINNUM32 | GRPDEF => {}
            LNAMES => {
                while !r.is_empty() {
                    lnames.push(r.read_string("LNAMES entry")?);
                }
            }
            SEGDEF32 => {
                let _attributes = r.read_u8("SEGDEF32 attributes")?;
                let size = r.read_u32("SEGDEF32 size")?;
                let name_index = r.read_index("SEGDEF32 name index")?;
                let class_index = r.read_index("SEGDEF32 class index")?;
                let _overlay_index = r.read_index("SEGDEF32 overlay index")?;

                let name = lname(&lnames, name_index, "SEGDEF32 name")?;
                let class = lname(&lnames, class_index, "SEGDEF32 class")?;
                let location = Location::from_class_name(class)?;

                let slot = object.segments(location).len();
                defs.push(SegmentDef {
                    location,
                    name: name.to_string(),
                    slot,
                });
                object.push_segment(
                    location,
                    Segment {
                        name: name.to_string(),
                        data: vec![0; size as usize],
                        relocs: HashMap::new(),
                        exports: HashMap::new(),
                    },
                );
            }
            EXTDEF | LEXTDEF => {
                let local = tag == LEXTDEF;
                // The body is read as a run of counted strings; the type
                // index byte after each name reads as a zero-length string
                // and must not occupy an extern index.
                while !r.is_empty() {
                    let name = r.read_string("EXTDEF name")?;
                    if name.is_empty() {
                        continue;
                    }
                    externs.push(ExternDef { name, local });
                }
            }
            PUBDEF | PUBDEF32 | LPUBDEF | LPUBDEF32 => {
                let local = tag & 0xfe == LPUBDEF;
                let offsets32 = tag & 1 != 0;

                let _group_index = r.read_index("PUBDEF group index")?;
                let segment_index = r.read_index("PUBDEF segment index")?;

                // Segment index 0 means the exports hang off an absolute
                // frame number. Useless for matching, but the entries still
                // have to be walked to keep the record consistent.
                let def_index = if segment_index == 0 {
                    let _frame = r.read_u16("PUBDEF frame number")?;
                    None
                } else {
                    Some(segment_def(&defs, segment_index, "PUBDEF")?)
                };

                while !r.is_empty() {
                    let name = r.read_string("PUBDEF name")?;
                    let offset = if offsets32 {
                        r.read_u32("PUBDEF offset")?
                    } else {
                        r.read_u16("PUBDEF offset")? as u32
                    };
                    let type_index = r.read_index("PUBDEF type index")?;
                    if type_index != 0 {
                        return Err(Error::InvalidObject(format!(
                            "unknown export type {} for {:?}",
                            type_index, name
                        )));
                    }

                    let Some(def_index) = def_index else { continue };
                    let def = &defs[def_index];
                    let target = SegmentRef {
                        location: def.location,
                        name: def.name.clone(),
                        offset,
                    };
                    if local {
                        local_exports.insert(name, target);
                    } else {
                        object
                            .segment_mut(def.location, def.slot)
                            .exports
                            .insert(name.clone(), offset);
                        global_exports.insert(name, target);
                    }
                }
            }
            LEDATA | LEDATA32 => {
                let offsets32 = tag & 1 != 0;
                let segment_index = r.read_index("LEDATA segment index")?;
                let def_index = segment_def(&defs, segment_index, "LEDATA")?;
                let offset = if offsets32 {
                    r.read_u32("LEDATA offset")?
                } else {
                    r.read_u16("LEDATA offset")? as u32
                };
                let payload = r.rest();

                let def = &defs[def_index];
                let segment = object.segment_mut(def.location, def.slot);
                let start = offset as usize;
                let end = start + payload.len();
                if end > segment.data.len() {
                    return Err(Error::InvalidObject(format!(
                        "LEDATA overruns segment {:?} ({} bytes at {:#x}, declared size {:#x})",
                        def.name,
                        payload.len(),
                        offset,
                        segment.data.len()
                    )));
                }
                segment.data[start..end].copy_from_slice(payload);
                last_data = Some((def_index, offset));
            }
            LIDATA32 => {
                let segment_index = r.read_index("LIDATA32 segment index")?;
                let def_index = segment_def(&defs, segment_index, "LIDATA32")?;
                let offset = r.read_u32("LIDATA32 offset")?;
                last_data = Some((def_index, offset));

                let def = &defs[def_index];
                let segment = object.segment_mut(def.location, def.slot);
                let mut content = r.rest();
                let mut write_pos = offset as usize;
                while !content.is_empty() {
                    if write_pos > segment.data.len() {
                        return Err(Error::InvalidObject(format!(
                            "LIDATA32 overruns segment {:?}",
                            def.name
                        )));
                    }
                    let (consumed, expanded) =
                        expand_lidata_block(content, &mut segment.data[write_pos..])?;
                    content = &content[consumed..];
                    write_pos += expanded;
                }
            }
            FIXUPP32 => {
                parse_fixupp32(
                    &mut r,
                    &defs,
                    &externs,
                    last_data,
                    &mut object,
                    &mut deferred,
                )?;
            }
            _ => {
                return Err(Error::UnknownTag {
                    tag,
                    offset: record_offset,
                })
            }
        }
    }

    // Local externs resolve within the object, so the relocation becomes an
    // ordinary local reference carrying the export offset plus the addend.
    for d in deferred {
        let export = local_exports.get(&d.name).ok_or_else(|| {
            Error::InvalidObject(format!("local extern {:?} is never defined", d.name))
        })?;
        let def = &defs[d.def_index];
        object.segment_mut(def.location, def.slot).relocs.insert(
            d.site,
            Relocation::Local {
                kind: d.kind,
                target: SegmentRef {
                    location: export.location,
                    name: export.name.clone(),
                    offset: export.offset.wrapping_add(d.addend),
                },
            },
        );
    }

    // The toolchain routes references to the object's own publics through
    // EXTDEF anyway; rewrite those back into local references so matching
    // never depends on the import index for intra-object targets.
    for location in Location::ALL {
        for segment in object.segments_mut(location) {
            for reloc in segment.relocs.values_mut() {
                let Relocation::Global { kind, name, addend } = &*reloc else {
                    continue;
                };
                let Some(export) = global_exports.get(name) else {
                    continue;
                };
                let rewritten = Relocation::Local {
                    kind: *kind,
                    target: SegmentRef {
                        location: export.location,
                        name: export.name.clone(),
                        offset: export.offset.wrapping_add(*addend),
                    },
                };
                *reloc = rewritten;
            }
        }
    }

    for location in Location::ALL {
        object.segments_mut(location).retain(|s| !s.is_empty());
    }

    Ok((object, pos))
}

/// Parse the fixup entries of one FIXUPP32 record.
#[allow(clippy::too_many_arguments)]
fn parse_fixupp32(
    r: &mut RecordReader,
    defs: &[SegmentDef],
    externs: &[ExternDef],
    last_data: Option<(usize, u32)>,
    object: &mut Object,
    deferred: &mut Vec<DeferredLocal>,
) -> Result<()> {
    while !r.is_empty() {
        let byte0 = r.read_u8("fixup")?;
        let byte1 = r.read_u8("fixup")?;
        let byte2 = r.read_u8("fixup")?;

        if byte0 & 0x80 == 0 {
            return Err(Error::UnsupportedFixup(format!(
                "threaded fixups are not supported ({:#04x})",
                byte0
            )));
        }
        if byte2 & 0x88 != 0 {
            return Err(Error::UnsupportedFixup(format!(
                "threaded fixups are not supported ({:#04x})",
                byte2
            )));
        }

        let absolute = byte0 & 0x40 != 0;
        let class = (byte0 >> 2) & 0xf;
        let offset10 = ((byte0 as u16 & 3) << 8) | byte1 as u16;

        let frame = (byte2 >> 4) & 0x7;
        let has_displacement = byte2 & 0x4 == 0;
        let target_method = byte2 & 0x3;

        let mut frame_index = 0u16;
        match frame {
            FRAME_SEGMENT | FRAME_GROUP | FRAME_EXTERNAL => {
                frame_index = r.read_index("fixup frame index")?;
            }
            FRAME_NUMBER => {
                return Err(Error::UnsupportedFixup(
                    "absolute frame numbers are not supported".to_string(),
                ));
            }
            FRAME_PREVIOUS => {
                return Err(Error::UnsupportedFixup(
                    "previous-segment frames are not supported".to_string(),
                ));
            }
            FRAME_TARGET => {}
            _ => {
                return Err(Error::UnsupportedFixup(
                    "fixup frame is not specified".to_string(),
                ));
            }
        }

        let target_index = r.read_index("fixup target index")?;

        // An external frame is only accepted as a redundant restatement of
        // the target; 32-bit and 48-bit fixups never consult the frame for
        // the actual patch value.
        if frame == FRAME_EXTERNAL && frame_index != target_index {
            return Err(Error::UnsupportedFixup(format!(
                "external frame index {} differs from target index {}",
                frame_index, target_index
            )));
        }

        let mut displacement = 0;
        if has_displacement {
            displacement = r.read_u32("fixup displacement")?;
        }

        if class != FIXUP_CLASS_OFFSET32 && class != FIXUP_CLASS_POINTER48 {
            return Err(Error::UnsupportedFixup(format!(
                "only 32-bit offset and 48-bit pointer fixups are supported (class {})",
                class
            )));
        }
        let kind = if class == FIXUP_CLASS_OFFSET32 {
            if absolute {
                RelocationKind::Absolute32
            } else {
                RelocationKind::Relative32
            }
        } else if absolute {
            RelocationKind::Absolute48
        } else {
            return Err(Error::UnsupportedFixup(
                "relative 48-bit pointers are not supported".to_string(),
            ));
        };

        let Some((def_index, data_offset)) = last_data else {
            return Err(Error::InvalidObject(
                "FIXUPP32 with no preceding LEDATA or LIDATA".to_string(),
            ));
        };
        let def = &defs[def_index];
        let segment = object.segment_mut(def.location, def.slot);

        let site = data_offset.wrapping_add(offset10 as u32);
        let start = site as usize;
        if start + kind.size() > segment.data.len() {
            return Err(Error::InvalidObject(format!(
                "fixup at {:#x} overruns segment {:?}",
                site, def.name
            )));
        }

        // The dword at the site is the addend the linker would have added;
        // lift it into the relocation and zero the site.
        let addend = displacement.wrapping_add(read_u32(&segment.data, start));
        segment.data[start..start + 4].copy_from_slice(&[0; 4]);

        match target_method {
            TARGET_SEGMENT => {
                let target_def = target_index
                    .checked_sub(1)
                    .and_then(|i| defs.get(i as usize))
                    .ok_or_else(|| {
                        Error::InvalidObject(format!(
                            "fixup references undefined segment {}",
                            target_index
                        ))
                    })?;
                segment.relocs.insert(
                    site,
                    Relocation::Local {
                        kind,
                        target: SegmentRef {
                            location: target_def.location,
                            name: target_def.name.clone(),
                            offset: addend,
                        },
                    },
                );
            }
            TARGET_EXTERNAL => {
                let extern_def = target_index
                    .checked_sub(1)
                    .and_then(|i| externs.get(i as usize))
                    .ok_or_else(|| {
                        Error::InvalidObject(format!(
                            "fixup references undefined extern {}",
                            target_index
                        ))
                    })?;
                if extern_def.local {
                    // Local externs resolve to offsets once LPUBDEFs are in.
                    deferred.push(DeferredLocal {
                        def_index,
                        site,
                        kind,
                        name: extern_def.name.clone(),
                        addend,
                    });
                } else {
                    segment.relocs.insert(
                        site,
                        Relocation::Global {
                            kind,
                            name: extern_def.name.clone(),
                            addend,
                        },
                    );
                }
            }
            TARGET_GROUP => {
                return Err(Error::UnsupportedFixup(
                    "group fixup targets are not supported".to_string(),
                ));
            }
            _ => {
                return Err(Error::UnsupportedFixup(
                    "absolute frame fixup targets are not supported".to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// One LIDATA32 block: u32 repeat count, u16 sub-block count, then either a
/// counted literal (count 0) or that many nested blocks. The expanded
/// content is replicated `repeat` times into `dst`. Returns (source bytes
/// consumed, destination bytes produced).
fn expand_lidata_block(src: &[u8], dst: &mut [u8]) -> Result<(usize, usize)> {
    if src.len() < 6 {
        return Err(Error::Truncated("LIDATA32 block header"));
    }
    let repeat = read_u32(src, 0) as usize;
    let block_count = read_u16(src, 4) as usize;

    let mut consumed = 6;
    let mut content_len = 0;
    if block_count == 0 {
        let literal_len = *src
            .get(consumed)
            .ok_or(Error::Truncated("LIDATA32 literal length"))? as usize;
        consumed += 1;
        if src.len() < consumed + literal_len {
            return Err(Error::Truncated("LIDATA32 literal"));
        }
        if literal_len > dst.len() {
            return Err(Error::InvalidObject(
                "LIDATA32 expansion overruns its segment".to_string(),
            ));
        }
        dst[..literal_len].copy_from_slice(&src[consumed..consumed + literal_len]);
        consumed += literal_len;
        content_len = literal_len;
    } else {
        for _ in 0..block_count {
            let (sub_consumed, sub_len) =
                expand_lidata_block(&src[consumed..], &mut dst[content_len..])?;
            consumed += sub_consumed;
            content_len += sub_len;
        }
    }

    let total = content_len.checked_mul(repeat).ok_or_else(|| {
        Error::InvalidObject("LIDATA32 repeat count overflows".to_string())
    })?;
    if total > dst.len() {
        return Err(Error::InvalidObject(
            "LIDATA32 expansion overruns its segment".to_string(),
        ));
    }
    for i in 1..repeat {
        dst.copy_within(..content_len, content_len * i);
    }

    Ok((consumed, total))
}

fn lname<'a>(lnames: &'a [String], index: u16, what: &str) -> Result<&'a str> {
    index
        .checked_sub(1)
        .and_then(|i| lnames.get(i as usize))
        .map(|s| s.as_str())
        .ok_or_else(|| Error::InvalidObject(format!("{} references LNAMES index {}", what, index)))
}

fn segment_def(defs: &[SegmentDef], index: u16, what: &str) -> Result<usize> {
    let i = index
        .checked_sub(1)
        .map(|i| i as usize)
        .filter(|&i| i < defs.len())
        .ok_or_else(|| {
            Error::InvalidObject(format!("{} references undefined segment {}", what, index))
        })?;
    Ok(i)
}
