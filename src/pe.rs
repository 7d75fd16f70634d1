//! PE32 reading: turn the target executable into per-Location byte regions.
//!
//! Only what matching needs is parsed: the image base, the image size (for
//! the plausible-address window), and one section per segment class. The
//! first executable section backs CODE, the first initialized-data section
//! backs DATA and CONST (the toolchain links constants into the data
//! section), and the first uninitialized section is synthesized as zeros
//! for BSS. STACK exists as an empty region so stack segments can never
//! match; BEGDATA is not mapped at all.
//!
//! Section buffers are sized to max(virtual size, raw size): the toolchain
//! of interest writes the BSS virtual size into the raw-size field, and
//! code/data tails beyond the raw bytes are zero at run time anyway.

use crate::error::{Error, Result};
use crate::omf::record::{read_u16, read_u32};
use crate::omf::Location;

const DOS_MAGIC: u16 = 0x5a4d;
const PE_SIGNATURE: u32 = 0x0000_4550;
const MACHINE_I386: u16 = 0x014c;
const PE32_MAGIC: u16 = 0x010b;

const SCN_CNT_CODE: u32 = 0x0000_0020;
const SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
const SCN_MEM_EXECUTE: u32 = 0x2000_0000;

const SECTION_ENTRY_SIZE: usize = 40;

/// One mapped region of the target: virtual base plus bytes.
#[derive(Debug, Clone)]
pub struct SectionImage {
    pub base: u32,
    pub data: Vec<u8>,
}

/// The target executable reduced to what the matcher consumes.
#[derive(Debug, Clone)]
pub struct TargetImage {
    pub image_base: u32,
    pub size_of_image: u32,
    sections: [Option<SectionImage>; Location::COUNT],
}

impl TargetImage {
    pub fn new(image_base: u32, size_of_image: u32) -> TargetImage {
        TargetImage {
            image_base,
            size_of_image,
            sections: Default::default(),
        }
    }

    pub fn insert(&mut self, location: Location, base: u32, data: Vec<u8>) {
        self.sections[location.index()] = Some(SectionImage { base, data });
    }

    /// The region backing a location, if the image maps one.
    pub fn section(&self, location: Location) -> Option<(u32, &[u8])> {
        self.sections[location.index()]
            .as_ref()
            .map(|s| (s.base, s.data.as_slice()))
    }

    /// Parse a PE32 executable and build the per-Location regions.
    pub fn from_pe(data: &[u8]) -> Result<TargetImage> {
        if data.len() < 0x40 {
            return Err(Error::InvalidImage("too small for a DOS header".to_string()));
        }
        if read_u16(data, 0) != DOS_MAGIC {
            return Err(Error::InvalidImage(format!(
                "bad DOS magic {:#06x}",
                read_u16(data, 0)
            )));
        }

        let pe_offset = read_u32(data, 0x3c) as usize;
        if pe_offset + 24 > data.len() {
            return Err(Error::InvalidImage("PE header out of bounds".to_string()));
        }
        if read_u32(data, pe_offset) != PE_SIGNATURE {
            return Err(Error::InvalidImage(format!(
                "bad PE signature {:#010x}",
                read_u32(data, pe_offset)
            )));
        }
        let machine = read_u16(data, pe_offset + 4);
        if machine != MACHINE_I386 {
            return Err(Error::InvalidImage(format!(
                "unexpected machine {:#06x}, wanted i386",
                machine
            )));
        }
        let section_count = read_u16(data, pe_offset + 6) as usize;
        let optional_size = read_u16(data, pe_offset + 20) as usize;
        if optional_size < 96 {
            return Err(Error::InvalidImage(format!(
                "optional header too small ({} bytes)",
                optional_size
            )));
        }
        if (optional_size - 96) % 8 != 0 {
            return Err(Error::InvalidImage(
                "misaligned data directory area".to_string(),
            ));
        }

        let optional_offset = pe_offset + 24;
        let table_offset = optional_offset + optional_size;
        if table_offset + section_count * SECTION_ENTRY_SIZE > data.len() {
            return Err(Error::InvalidImage("section table out of bounds".to_string()));
        }
        if read_u16(data, optional_offset) != PE32_MAGIC {
            return Err(Error::InvalidImage(format!(
                "bad optional header magic {:#06x}, wanted PE32",
                read_u16(data, optional_offset)
            )));
        }
        let directory_count = read_u32(data, optional_offset + 92) as usize;
        if directory_count != (optional_size - 96) / 8 {
            return Err(Error::InvalidImage(format!(
                "data directory count {} does not fit the optional header size",
                directory_count
            )));
        }

        let image_base = read_u32(data, optional_offset + 28);
        let size_of_image = read_u32(data, optional_offset + 56);

        let mut image = TargetImage::new(image_base, size_of_image);
        let mut data_region: Option<SectionImage> = None;

        for index in 0..section_count {
            let entry = table_offset + index * SECTION_ENTRY_SIZE;
            let virtual_size = read_u32(data, entry + 8);
            let virtual_address = read_u32(data, entry + 12);
            let mut raw_size = read_u32(data, entry + 16);
            let mut raw_offset = read_u32(data, entry + 20);
            let characteristics = read_u32(data, entry + 36);

            // The toolchain misreports some virtual sizes (BSS in
            // particular carries its size in the raw-size field only), so
            // the quirk is absorbed before the raw fields are normalized.
            let mapped_size = virtual_size.max(raw_size) as usize;
            if raw_offset == 0 || raw_size == 0 {
                raw_offset = 0;
                raw_size = 0;
            }
            let base = image_base.wrapping_add(virtual_address);

            let is_code = characteristics & (SCN_CNT_CODE | SCN_MEM_EXECUTE) != 0;
            let is_bss = characteristics & SCN_CNT_UNINITIALIZED_DATA != 0;
            let is_data = characteristics & SCN_CNT_INITIALIZED_DATA != 0;

            if is_bss {
                if image.section(Location::Bss).is_none() {
                    image.insert(Location::Bss, base, vec![0; mapped_size]);
                }
                continue;
            }

            let raw_end = raw_offset as usize + raw_size as usize;
            if raw_end > data.len() {
                return Err(Error::InvalidImage(format!(
                    "section {} raw data out of bounds",
                    index
                )));
            }
            let mut bytes = vec![0u8; mapped_size];
            let copied = (raw_size as usize).min(mapped_size);
            bytes[..copied].copy_from_slice(&data[raw_offset as usize..raw_offset as usize + copied]);

            if is_code {
                if image.section(Location::Code).is_none() {
                    image.insert(Location::Code, base, bytes);
                }
            } else if is_data && data_region.is_none() {
                data_region = Some(SectionImage { base, data: bytes });
            }
        }

        if image.section(Location::Code).is_none() {
            return Err(Error::InvalidImage("no code section".to_string()));
        }
        if let Some(region) = data_region {
            image.insert(Location::Data, region.base, region.data.clone());
            // Constants link into the data section; CONST shares its bytes.
            image.insert(Location::Const, region.base, region.data);
        }
        image.insert(Location::Stack, 0, Vec::new());

        Ok(image)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct SectionSpec {
        pub virtual_size: u32,
        pub virtual_address: u32,
        pub raw: Vec<u8>,
        pub characteristics: u32,
    }

    /// Assemble a minimal PE32 image: DOS stub, PE header, 96-byte optional
    /// header, section table, then raw section data.
    pub(crate) fn build_pe(image_base: u32, size_of_image: u32, sections: &[SectionSpec]) -> Vec<u8> {
        let pe_offset = 0x40usize;
        let optional_offset = pe_offset + 24;
        let table_offset = optional_offset + 96;
        let mut raw_offset = table_offset + sections.len() * SECTION_ENTRY_SIZE;

        let mut out = vec![0u8; raw_offset];
        out[0..2].copy_from_slice(&DOS_MAGIC.to_le_bytes());
        out[0x3c..0x40].copy_from_slice(&(pe_offset as u32).to_le_bytes());

        out[pe_offset..pe_offset + 4].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
        out[pe_offset + 4..pe_offset + 6].copy_from_slice(&MACHINE_I386.to_le_bytes());
        out[pe_offset + 6..pe_offset + 8].copy_from_slice(&(sections.len() as u16).to_le_bytes());
        out[pe_offset + 20..pe_offset + 22].copy_from_slice(&96u16.to_le_bytes());

        out[optional_offset..optional_offset + 2].copy_from_slice(&PE32_MAGIC.to_le_bytes());
        out[optional_offset + 28..optional_offset + 32].copy_from_slice(&image_base.to_le_bytes());
        out[optional_offset + 56..optional_offset + 60].copy_from_slice(&size_of_image.to_le_bytes());
        // data directory count stays zero to match the 96-byte header

        for (index, spec) in sections.iter().enumerate() {
            let entry = table_offset + index * SECTION_ENTRY_SIZE;
            out[entry + 8..entry + 12].copy_from_slice(&spec.virtual_size.to_le_bytes());
            out[entry + 12..entry + 16].copy_from_slice(&spec.virtual_address.to_le_bytes());
            out[entry + 16..entry + 20].copy_from_slice(&(spec.raw.len() as u32).to_le_bytes());
            let offset = if spec.raw.is_empty() { 0 } else { raw_offset as u32 };
            out[entry + 20..entry + 24].copy_from_slice(&offset.to_le_bytes());
            out[entry + 36..entry + 40].copy_from_slice(&spec.characteristics.to_le_bytes());
            raw_offset += spec.raw.len();
        }
        for spec in sections {
            out.extend_from_slice(&spec.raw);
        }
        out
    }

    pub(crate) fn watcom_like_pe() -> Vec<u8> {
        build_pe(
            0x400000,
            0x10000,
            &[
                SectionSpec {
                    virtual_size: 8,
                    virtual_address: 0x1000,
                    raw: vec![0xde, 0xad, 0xbe, 0xef, 0x55, 0x8b, 0xec, 0xc3],
                    characteristics: SCN_CNT_CODE | SCN_MEM_EXECUTE,
                },
                SectionSpec {
                    virtual_size: 6,
                    virtual_address: 0x3000,
                    raw: vec![1, 2, 3, 4],
                    characteristics: SCN_CNT_INITIALIZED_DATA,
                },
                SectionSpec {
                    // BSS quirk: virtual size lives in the raw-size field.
                    virtual_size: 0,
                    virtual_address: 0x4000,
                    raw: Vec::new(),
                    characteristics: SCN_CNT_UNINITIALIZED_DATA,
                },
            ],
        )
    }

    #[test]
    fn test_sections_map_to_locations() {
        let image = TargetImage::from_pe(&watcom_like_pe()).unwrap();
        assert_eq!(image.image_base, 0x400000);
        assert_eq!(image.size_of_image, 0x10000);

        let (code_base, code) = image.section(Location::Code).unwrap();
        assert_eq!(code_base, 0x401000);
        assert_eq!(code, &[0xde, 0xad, 0xbe, 0xef, 0x55, 0x8b, 0xec, 0xc3]);

        // Virtual size beyond the raw bytes is zero-filled.
        let (data_base, data) = image.section(Location::Data).unwrap();
        assert_eq!(data_base, 0x403000);
        assert_eq!(data, &[1, 2, 3, 4, 0, 0]);

        // CONST coalesces with DATA.
        let (const_base, const_data) = image.section(Location::Const).unwrap();
        assert_eq!(const_base, data_base);
        assert_eq!(const_data, data);

        let (stack_base, stack) = image.section(Location::Stack).unwrap();
        assert_eq!((stack_base, stack.len()), (0, 0));
        assert!(image.section(Location::BegData).is_none());
    }

    #[test]
    fn test_bss_synthesized_from_raw_size_quirk() {
        let mut pe = build_pe(
            0x400000,
            0x10000,
            &[
                SectionSpec {
                    virtual_size: 4,
                    virtual_address: 0x1000,
                    raw: vec![0x90; 4],
                    characteristics: SCN_CNT_CODE,
                },
                SectionSpec {
                    virtual_size: 0,
                    virtual_address: 0x4000,
                    raw: Vec::new(),
                    characteristics: SCN_CNT_UNINITIALIZED_DATA,
                },
            ],
        );
        // The toolchain writes the BSS size into the raw-size field while
        // leaving the raw offset zero; patch the second section entry to
        // look like that.
        let entry = 0x40 + 24 + 96 + SECTION_ENTRY_SIZE;
        pe[entry + 16..entry + 20].copy_from_slice(&0x20u32.to_le_bytes());

        let image = TargetImage::from_pe(&pe).unwrap();
        let (bss_base, bss) = image.section(Location::Bss).unwrap();
        assert_eq!(bss_base, 0x404000);
        assert_eq!(bss, &vec![0u8; 0x20][..]);
    }

    #[test]
    fn test_rejects_non_i386() {
        let mut pe = watcom_like_pe();
        pe[0x44..0x46].copy_from_slice(&0x8664u16.to_le_bytes());
        assert!(matches!(
            TargetImage::from_pe(&pe),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_rejects_bad_dos_magic() {
        let mut pe = watcom_like_pe();
        pe[0] = b'Z';
        assert!(matches!(
            TargetImage::from_pe(&pe),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_rejects_missing_code_section() {
        let pe = build_pe(
            0x400000,
            0x10000,
            &[SectionSpec {
                virtual_size: 4,
                virtual_address: 0x3000,
                raw: vec![1, 2, 3, 4],
                characteristics: SCN_CNT_INITIALIZED_DATA,
            }],
        );
        assert!(matches!(
            TargetImage::from_pe(&pe),
            Err(Error::InvalidImage(_))
        ));
    }
}
