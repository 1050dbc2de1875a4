//! Syntaxical representation of a Sponge schematic - the typed view of its tag tree
//! and the grammar of block state keys.
//!
//! The tag tree itself is decoded by `fastnbt`; this module only names the tags
//! the converter reads and checks their shape.
use std::{convert::TryFrom, io::Read, path::Path};

use anyhow::{Context, Result};
use fastnbt::ByteArray;
use flate2::read::GzDecoder;
use indexmap::IndexMap;
use nom::{
    IResult, Err as NomErr,
    bytes::complete::take_while1,
    character::complete::char,
    combinator::{all_consuming, map, opt},
    error::VerboseError,
    multi::separated_list1,
    sequence::{delimited, pair, separated_pair},
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// A `u32` never needs more than five 7-bit groups.
const MAX_VARINT_LEN: usize = 5;

#[derive(Error, Debug)]
pub enum SyntaxError {
    #[error("Could not decompress schematic")]
    Decompress(#[source] std::io::Error),
    #[error("Malformed tag tree")]
    Nbt(#[from] fastnbt::error::Error),
    #[error("Schematic dimensions must be positive, found width {width} and length {length}")]
    InvalidDimensions { width: u16, length: u16 },
    #[error("Palette entry {key:?} has negative index {index}")]
    NegativePaletteIndex { key: String, index: i32 },
    #[error("Block data ends in the middle of a varint at byte {offset}")]
    TruncatedVarint { offset: usize },
    #[error("Block data varint at byte {offset} is longer than five bytes")]
    VarintTooLong { offset: usize },
    #[error("Malformed palette key {key:?}: unexpected input at byte {offset}")]
    MalformedPaletteKey { key: String, offset: usize },
}

/// Block state key to palette index, in the order the tag tree lists them.
pub type Palette = IndexMap<String, u32>;

/// The tags of a Sponge schematic root compound the converter reads.
#[derive(Debug, Deserialize)]
struct RawSchematic {
    #[serde(rename = "Version", default)]
    version: Option<i32>,
    #[serde(rename = "Width")]
    width: i16,
    #[serde(rename = "Length")]
    length: i16,
    #[serde(rename = "PaletteMax", default)]
    palette_max: Option<i32>,
    #[serde(rename = "Palette")]
    palette: IndexMap<String, i32>,
    #[serde(rename = "BlockData")]
    block_data: ByteArray,
}

/// A decoded schematic: dimensions, palette and one palette index per voxel.
#[derive(Debug, Clone, PartialEq)]
pub struct Schematic {
    pub version: Option<i32>,
    width: u16,
    length: u16,
    pub palette: Palette,
    pub block_data: Vec<u32>,
}

impl Schematic {
    pub fn new(width: u16, length: u16, palette: Palette, block_data: Vec<u32>) -> Result<Self> {
        if width == 0 || length == 0 {
            return Err(SyntaxError::InvalidDimensions { width, length }.into())
        }
        let layer = width as usize * length as usize;
        if block_data.len() % layer != 0 {
            warn!(
                voxels = block_data.len(),
                width, length,
                "block data does not fill a whole number of layers"
            );
        }
        Ok(Schematic { version: None, width, length, palette, block_data })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    /// Number of layers, `len(block_data) / (width * length)`.
    pub fn height(&self) -> usize {
        self.block_data.len() / (self.width as usize * self.length as usize)
    }
}

impl Schematic {
    fn from_raw(raw: RawSchematic) -> Result<Self> {
        let mut palette = Palette::with_capacity(raw.palette.len());
        for (key, index) in raw.palette {
            let index = u32::try_from(index)
                .map_err(|_| SyntaxError::NegativePaletteIndex { key: key.clone(), index })?;
            palette.insert(key, index);
        }
        if let Some(palette_max) = raw.palette_max {
            if palette_max as i64 != palette.len() as i64 {
                warn!(palette_max, entries = palette.len(), "PaletteMax disagrees with palette size");
            }
        }
        let bytes = raw.block_data.iter().map(|&byte| byte as u8).collect::<Vec<u8>>();
        let block_data = decode_varints(&bytes)?;
        debug!(version = ?raw.version, bytes = bytes.len(), voxels = block_data.len(), "decoded block data");
        // Shorts are stored signed; schematic sizes are not.
        let mut schematic = Schematic::new(raw.width as u16, raw.length as u16, palette, block_data)?;
        schematic.version = raw.version;
        Ok(schematic)
    }
}

/// Gunzips `bytes` if they start with the gzip magic, otherwise returns them as raw NBT.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut decompressed = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut decompressed)
            .map_err(SyntaxError::Decompress)?;
        debug!(compressed = bytes.len(), decompressed = decompressed.len(), "gunzipped schematic");
        Ok(decompressed)
    } else {
        Ok(bytes.to_vec())
    }
}

/// Decodes a run of unsigned LEB128 varints, the encoding of `BlockData`.
pub fn decode_varints(bytes: &[u8]) -> Result<Vec<u32>> {
    let mut values = Vec::with_capacity(bytes.len());
    let mut value = 0u32;
    let mut len = 0;
    for (offset, &byte) in bytes.iter().enumerate() {
        if len == MAX_VARINT_LEN {
            return Err(SyntaxError::VarintTooLong { offset: offset - len }.into())
        }
        value |= u32::from(byte & 0x7f) << (7 * len);
        len += 1;
        if byte & 0x80 == 0 {
            values.push(value);
            value = 0;
            len = 0;
        }
    }
    if len != 0 {
        return Err(SyntaxError::TruncatedVarint { offset: bytes.len() - len }.into())
    }
    Ok(values)
}

pub fn parse_bytes(bytes: &[u8]) -> Result<Schematic> {
    let nbt = decompress(bytes)?;
    let raw: RawSchematic = fastnbt::from_bytes(&nbt).map_err(SyntaxError::Nbt)?;
    Schematic::from_raw(raw)
}

pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Schematic> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;
    parse_bytes(&bytes).with_context(|| format!("Could not decode {}", path.display()))
}

/// A block state key split into its name and bracketed properties,
/// e.g. `minecraft:furnace[facing=north,lit=true]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockState<'a> {
    pub name: &'a str,
    pub properties: Vec<(&'a str, &'a str)>,
}

type ParseResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

fn property_token(i: &str) -> ParseResult<&str> {
    take_while1(|c: char| !matches!(c, '=' | ',' | '[' | ']'))(i)
}

fn property(i: &str) -> ParseResult<(&str, &str)> {
    separated_pair(property_token, char('='), property_token)(i)
}

fn properties(i: &str) -> ParseResult<Vec<(&str, &str)>> {
    delimited(char('['), separated_list1(char(','), property), char(']'))(i)
}

fn block_state(i: &str) -> ParseResult<BlockState> {
    map(
        pair(take_while1(|c: char| c != '['), opt(properties)),
        |(name, properties)| BlockState { name, properties: properties.unwrap_or_default() },
    )(i)
}

impl<'a> BlockState<'a> {
    /// Parses the whole key; anything left over after the properties is malformed.
    pub fn parse(key: &'a str) -> Result<Self> {
        match all_consuming(block_state)(key) {
            Ok((_, state)) => Ok(state),
            Err(NomErr::Error(e)) | Err(NomErr::Failure(e)) => {
                let offset = e.errors.first().map_or(0, |(rest, _)| key.len() - rest.len());
                Err(SyntaxError::MalformedPaletteKey { key: key.to_owned(), offset }.into())
            }
            Err(NomErr::Incomplete(_)) => {
                Err(SyntaxError::MalformedPaletteKey { key: key.to_owned(), offset: key.len() }.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malformed_offset(key: &str) -> usize {
        let err = BlockState::parse(key).unwrap_err();
        match err.downcast_ref::<SyntaxError>() {
            Some(SyntaxError::MalformedPaletteKey { offset, .. }) => *offset,
            other => panic!("expected malformed key, got {:?}", other),
        }
    }

    #[test]
    fn plain_key() {
        let state = BlockState::parse("minecraft:stone").unwrap();
        assert_eq!(state.name, "minecraft:stone");
        assert!(state.properties.is_empty());
    }

    #[test]
    fn key_with_properties() {
        let state = BlockState::parse("minecraft:furnace[facing=north,lit=true]").unwrap();
        assert_eq!(state.name, "minecraft:furnace");
        assert_eq!(state.properties, vec![("facing", "north"), ("lit", "true")]);
    }

    #[test]
    fn malformed_keys() {
        assert_eq!(malformed_offset("minecraft:stone["), 15);
        assert_eq!(malformed_offset("minecraft:stone[lit=true"), 15);
        assert_eq!(malformed_offset("minecraft:stone[]"), 15);
        assert_eq!(malformed_offset("minecraft:stone[lit]"), 15);
        assert_eq!(malformed_offset("minecraft:stone[a=b=c]"), 15);
        assert_eq!(malformed_offset("minecraft:stone[a=b]x"), 20);
        assert_eq!(malformed_offset(""), 0);
    }

    #[test]
    fn varints() {
        assert_eq!(decode_varints(&[0, 1, 0x7f]).unwrap(), vec![0, 1, 127]);
        assert_eq!(decode_varints(&[0x80, 0x02, 5]).unwrap(), vec![256, 5]);
        assert_eq!(decode_varints(&[]).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn broken_varints() {
        let err = decode_varints(&[1, 0x80]).unwrap_err();
        assert!(matches!(err.downcast_ref::<SyntaxError>(), Some(SyntaxError::TruncatedVarint { offset: 1 })));
        let err = decode_varints(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err.downcast_ref::<SyntaxError>(), Some(SyntaxError::VarintTooLong { offset: 0 })));
    }

    #[test]
    fn zero_width_is_rejected() {
        let err = Schematic::new(0, 4, Palette::new(), Vec::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyntaxError>(),
            Some(SyntaxError::InvalidDimensions { width: 0, length: 4 })
        ));
    }

    #[test]
    fn plain_nbt_passes_through() {
        assert_eq!(decompress(&[10, 0, 0, 0]).unwrap(), vec![10, 0, 0, 0]);
    }
}
