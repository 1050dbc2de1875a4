//! Converts Sponge schematics into a palette table and a voxel index file
//! using a [semantic](`semantic`) representation of their blocks.
//! # Converting a schematic
//! ```
//! use schem2vox::{semantic::Conversion, syntax::{Palette, Schematic}};
//!
//! let mut palette = Palette::new();
//! palette.insert("minecraft:furnace[facing=north,lit=true]".to_string(), 3);
//! let schematic = Schematic::new(2, 2, palette, vec![3; 8]).unwrap();
//! let conversion = Conversion::from_schematic(&schematic).unwrap();
//! assert_eq!(conversion.palette_text(), "3 furnace @north lit\n");
//! assert_eq!(&conversion.indices_bytes()[4..8], &[1, 0, 0, 3]);
//! ```

pub mod syntax;
pub mod semantic;
