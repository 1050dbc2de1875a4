//! Semantic representation of a converted schematic - palette entries and voxel records,
//! and the two artifacts they are written to.
//!
//! The palette artifact is one line per entry, `index name [@orientation] [flags...]`,
//! with empty fields left out. The indices artifact is a flat run of 4-byte
//! `x, y, z, index` records.

use std::{convert::TryFrom, fmt::{self, Formatter}, io::Write, path::Path, str::FromStr};
use crate::syntax::{BlockState, Palette, Schematic, SyntaxError};
use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

const MINECRAFT_NAMESPACE: &str = "minecraft:";
const FACING: &str = "facing";
const ORIENTATION_MARKER: char = '@';
const RECORD_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum SemanticError {
    #[error("Palette line {line:?} has no {missing}")]
    MalformedPaletteLine { line: String, missing: &'static str },
    #[error("Palette line {line:?} has more than one orientation")]
    DuplicateOrientation { line: String },
    #[error("Index data is {len} bytes long, not a multiple of 4")]
    TruncatedRecord { len: usize },
}

/// One line of the palette artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteEntry {
    pub index: u32,
    /// Block name without the `minecraft:` namespace.
    pub name: String,
    /// Value of the `facing` property.
    pub orientation: Option<String>,
    /// Names of the properties set to `true`, in key order.
    pub flags: Vec<String>,
}

impl PaletteEntry {
    /// Builds the entry for one block state key. Properties that are neither
    /// `facing` nor `true` are dropped.
    pub fn from_key(key: &str, index: u32) -> Result<Self> {
        let state = BlockState::parse(key)?;
        let mut orientation = None;
        let mut flags = Vec::new();
        for (property, value) in state.properties {
            if property == FACING {
                orientation = Some(value.to_owned());
            } else if value == "true" {
                flags.push(property.to_owned());
            }
        }
        Ok(PaletteEntry {
            index,
            name: state.name.strip_prefix(MINECRAFT_NAMESPACE).unwrap_or(state.name).to_owned(),
            orientation,
            flags,
        })
    }

    /// The newline-terminated artifact line.
    pub fn line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for PaletteEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.index, self.name)?;
        if let Some(orientation) = &self.orientation {
            write!(f, " {}{}", ORIENTATION_MARKER, orientation)?;
        }
        for flag in &self.flags {
            write!(f, " {}", flag)?;
        }
        Ok(())
    }
}

impl FromStr for PaletteEntry {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let malformed = |missing| SemanticError::MalformedPaletteLine { line: line.to_owned(), missing };
        let mut tokens = line.split_whitespace();
        let index = tokens.next().ok_or_else(|| malformed("index"))?
            .parse::<u32>().map_err(|_| malformed("numeric index"))?;
        let name = tokens.next().ok_or_else(|| malformed("block name"))?.to_owned();
        let mut orientation = None;
        let mut flags = Vec::new();
        for token in tokens {
            if let Some(value) = token.strip_prefix(ORIENTATION_MARKER) {
                if orientation.replace(value.to_owned()).is_some() {
                    return Err(SemanticError::DuplicateOrientation { line: line.to_owned() }.into())
                }
            } else {
                flags.push(token.to_owned());
            }
        }
        Ok(PaletteEntry { index, name, orientation, flags })
    }
}

/// Extracts every palette entry in the palette's own order. Fails on the
/// first malformed key, since later lookups are keyed by index.
pub fn extract_palette(palette: &Palette) -> Result<Vec<PaletteEntry>> {
    palette.iter()
        .map(|(key, &index)| PaletteEntry::from_key(key, index))
        .collect()
}

pub fn palette_text(entries: &[PaletteEntry]) -> String {
    entries.iter().map(PaletteEntry::line).collect()
}

pub fn parse_palette_text(text: &str) -> Result<Vec<PaletteEntry>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(PaletteEntry::from_str)
        .collect()
}

/// The x/z extent of a volume. Voxels are stored x fastest, then z, then y.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    width: usize,
    length: usize,
}

impl Dimensions {
    pub fn new(width: u16, length: u16) -> Result<Self> {
        if width == 0 || length == 0 {
            return Err(SyntaxError::InvalidDimensions { width, length }.into())
        }
        Ok(Dimensions { width: width as usize, length: length as usize })
    }

    pub fn width(self) -> usize {
        self.width
    }

    pub fn length(self) -> usize {
        self.length
    }

    /// Position `[x, y, z]` of the voxel at `offset` in block data.
    pub fn delinearize(self, offset: usize) -> [usize; 3] {
        let x = offset % self.width;
        let z = (offset / self.width) % self.length;
        let y = offset / (self.width * self.length);
        [x, y, z]
    }

    pub fn linearize(self, [x, y, z]: [usize; 3]) -> usize {
        (y * self.length + z) * self.width + x
    }
}

impl From<&Schematic> for Dimensions {
    fn from(schematic: &Schematic) -> Self {
        // Schematic::new has already rejected zero dimensions.
        Dimensions { width: schematic.width() as usize, length: schematic.length() as usize }
    }
}

/// A voxel of the indices artifact: a position and an index into the palette.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VoxelRecord {
    pub pos: [u8; 3],
    pub index: u8,
}

impl VoxelRecord {
    /// `None` if any coordinate or the index does not fit in a byte.
    pub fn new(pos: [usize; 3], index: u32) -> Option<Self> {
        let [x, y, z] = pos;
        Some(VoxelRecord {
            pos: [u8::try_from(x).ok()?, u8::try_from(y).ok()?, u8::try_from(z).ok()?],
            index: u8::try_from(index).ok()?,
        })
    }

    pub fn bytes(self) -> [u8; RECORD_LEN] {
        [self.pos[0], self.pos[1], self.pos[2], self.index]
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        VoxelRecord { pos: [bytes[0], bytes[1], bytes[2]], index: bytes[3] }
    }
}

impl fmt::Debug for VoxelRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:03},{:03},{:03}:{:03}", self.pos[0], self.pos[1], self.pos[2], self.index)
    }
}

/// A voxel left out of the indices artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfRangeVoxel {
    /// Position in block data.
    pub offset: usize,
    pub pos: [usize; 3],
    pub index: u32,
}

impl fmt::Display for OutOfRangeVoxel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "position {} {} {} with palette index {} out of bounds", self.pos[0], self.pos[1], self.pos[2], self.index)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Encoded {
    pub records: Vec<VoxelRecord>,
    pub skipped: Vec<OutOfRangeVoxel>,
}

/// Encodes block data in storage order, skipping voxels that do not fit in a byte.
pub fn encode_voxels(dimensions: Dimensions, block_data: &[u32]) -> Encoded {
    let mut encoded = Encoded { records: Vec::with_capacity(block_data.len()), skipped: Vec::new() };
    for (offset, &index) in block_data.iter().enumerate() {
        let pos = dimensions.delinearize(offset);
        match VoxelRecord::new(pos, index) {
            Some(record) => encoded.records.push(record),
            None => {
                let voxel = OutOfRangeVoxel { offset, pos, index };
                warn!(offset, x = pos[0], y = pos[1], z = pos[2], index, "{}", voxel);
                encoded.skipped.push(voxel);
            }
        }
    }
    encoded
}

pub fn indices_bytes(records: &[VoxelRecord]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(records.len() * RECORD_LEN);
    for record in records {
        bytes.extend(&record.bytes());
    }
    bytes
}

pub fn parse_indices(bytes: &[u8]) -> Result<Vec<VoxelRecord>> {
    if bytes.len() % RECORD_LEN != 0 {
        return Err(SemanticError::TruncatedRecord { len: bytes.len() }.into())
    }
    Ok(bytes.chunks_exact(RECORD_LEN).map(VoxelRecord::from_bytes).collect())
}

/// Both artifacts of one schematic, held in memory until written.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    pub palette: Vec<PaletteEntry>,
    pub voxels: Encoded,
}

impl Conversion {
    /// Extracts the palette first so that a malformed key aborts before any voxel work.
    pub fn from_schematic(schematic: &Schematic) -> Result<Self> {
        let palette = extract_palette(&schematic.palette)?;
        debug!(entries = palette.len(), "extracted palette");
        let voxels = encode_voxels(Dimensions::from(schematic), &schematic.block_data);
        debug!(records = voxels.records.len(), skipped = voxels.skipped.len(), height = schematic.height(), "encoded voxels");
        Ok(Conversion { palette, voxels })
    }

    pub fn palette_text(&self) -> String {
        palette_text(&self.palette)
    }

    pub fn indices_bytes(&self) -> Vec<u8> {
        indices_bytes(&self.voxels.records)
    }

    pub fn write<P: Write, I: Write>(&self, palette: &mut P, indices: &mut I) -> Result<()> {
        palette.write_all(self.palette_text().as_bytes())?;
        indices.write_all(&self.indices_bytes())?;
        Ok(())
    }

    /// Stages both artifacts next to their destinations and only moves them into
    /// place once both are fully written, so a failure leaves neither behind.
    pub fn write_to<P: AsRef<Path>, I: AsRef<Path>>(&self, palette_path: P, indices_path: I) -> Result<()> {
        let (palette_path, indices_path) = (palette_path.as_ref(), indices_path.as_ref());
        let palette = stage(palette_path, self.palette_text().as_bytes())?;
        let indices = stage(indices_path, &self.indices_bytes())?;
        palette.persist(palette_path)
            .with_context(|| format!("Could not write {}", palette_path.display()))?;
        if let Err(err) = indices.persist(indices_path) {
            let _ = std::fs::remove_file(palette_path);
            return Err(err).with_context(|| format!("Could not write {}", indices_path.display()))
        }
        info!(
            entries = self.palette.len(),
            records = self.voxels.records.len(),
            skipped = self.voxels.skipped.len(),
            palette = %palette_path.display(),
            indices = %indices_path.display(),
            "wrote schematic artifacts"
        );
        Ok(())
    }
}

fn stage(path: &Path, contents: &[u8]) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("Could not stage {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Could not stage {}", path.display()))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, index: u32) -> PaletteEntry {
        PaletteEntry::from_key(key, index).unwrap()
    }

    #[test]
    fn plain_block() {
        let stone = entry("minecraft:stone", 1);
        assert_eq!(stone.name, "stone");
        assert_eq!(stone.orientation, None);
        assert!(stone.flags.is_empty());
        assert_eq!(stone.line(), "1 stone\n");
    }

    #[test]
    fn namespace_is_stripped_only_when_exact() {
        assert_eq!(entry("create:gearbox", 0).name, "create:gearbox");
        assert_eq!(entry("Minecraft:stone", 0).name, "Minecraft:stone");
    }

    #[test]
    fn furnace_line() {
        assert_eq!(entry("minecraft:furnace[facing=north,lit=true]", 3).line(), "3 furnace @north lit\n");
    }

    #[test]
    fn repeated_facing_keeps_one_orientation() {
        let line = entry("minecraft:x[facing=north,facing=south]", 1).line();
        assert_eq!(line, "1 x @south\n");
        assert_eq!(line.matches(ORIENTATION_MARKER).count(), 1);
    }

    #[test]
    fn false_and_valued_properties_are_dropped() {
        let stairs = entry("minecraft:oak_stairs[facing=east,half=bottom,shape=straight,waterlogged=false]", 7);
        assert_eq!(stairs.to_string(), "7 oak_stairs @east");
        let lever = entry("minecraft:lever[face=wall,powered=true,facing=south]", 9);
        assert_eq!(lever.to_string(), "9 lever @south powered");
    }

    #[test]
    fn palette_keeps_source_order() {
        let mut palette = Palette::new();
        palette.insert("minecraft:dirt".to_owned(), 2);
        palette.insert("minecraft:air".to_owned(), 0);
        palette.insert("minecraft:stone".to_owned(), 1);
        let text = palette_text(&extract_palette(&palette).unwrap());
        assert_eq!(text, "2 dirt\n0 air\n1 stone\n");
    }

    #[test]
    fn palette_line_parses_back() {
        let furnace = entry("minecraft:furnace[facing=north,lit=true]", 3);
        assert_eq!("3 furnace @north lit".parse::<PaletteEntry>().unwrap(), furnace);
        assert!("furnace".parse::<PaletteEntry>().is_err());
        assert!("3 furnace @north @south".parse::<PaletteEntry>().is_err());
    }

    #[test]
    fn delinearize_is_x_then_z_then_y() {
        let dimensions = Dimensions::new(3, 2).unwrap();
        assert_eq!(dimensions.delinearize(0), [0, 0, 0]);
        assert_eq!(dimensions.delinearize(2), [2, 0, 0]);
        assert_eq!(dimensions.delinearize(3), [0, 0, 1]);
        assert_eq!(dimensions.delinearize(6), [0, 1, 0]);
        for offset in 0..3 * 2 * 4 {
            assert_eq!(dimensions.linearize(dimensions.delinearize(offset)), offset);
        }
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        for (width, length) in [(0, 2), (2, 0), (0, 0)].iter().copied() {
            let err = Dimensions::new(width, length).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<SyntaxError>(),
                Some(SyntaxError::InvalidDimensions { .. })
            ));
        }
    }

    #[test]
    fn record_bounds() {
        assert_eq!(VoxelRecord::new([255, 255, 255], 255).unwrap().bytes(), [255, 255, 255, 255]);
        assert!(VoxelRecord::new([256, 0, 0], 0).is_none());
        assert!(VoxelRecord::new([0, 256, 0], 0).is_none());
        assert!(VoxelRecord::new([0, 0, 256], 0).is_none());
        assert!(VoxelRecord::new([0, 0, 0], 256).is_none());
    }

    #[test]
    fn wide_volume_skips_columns() {
        let encoded = encode_voxels(Dimensions::new(257, 1).unwrap(), &vec![1; 257]);
        assert_eq!(encoded.records.len(), 256);
        assert_eq!(encoded.skipped, vec![OutOfRangeVoxel { offset: 256, pos: [256, 0, 0], index: 1 }]);
    }

    #[test]
    fn indices_must_be_whole_records() {
        assert!(parse_indices(&[1, 2, 3]).is_err());
        assert_eq!(parse_indices(&[1, 2, 3, 4]).unwrap(), vec![VoxelRecord { pos: [1, 2, 3], index: 4 }]);
    }
}
