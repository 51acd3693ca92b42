//! Kernel source text and the packed-index kernel's result layout.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::fmt;

/// Side length of the packed-index grid.
pub const GRID_DIM: usize = 8;

/// Entry point defined by [`PACKED_INDEX_SOURCE`].
pub const ENTRY_POINT: &str = "entry_point";

/// Writes `(i << 8) | j` at position `i + 8 * j` for global id `(i, j)`.
pub const PACKED_INDEX_SOURCE: &str = "__kernel void entry_point(__global int *C) {\n\
    \x20   // Get the indexes of the current work items\n\
    \x20   int i = get_global_id(0);\n\
    \x20   int j = get_global_id(1);\n\
    \n\
    \x20   // Store the packed index at the relevant location\n\
    \x20   C[i + 8 * j] = (i << 8 | j);\n\
    }\n";

/// The packed-index kernel extended with a by-value `struct color` argument.
/// Work item `(0, 0)` also stores `c.r + c.g + c.b` into `out[0]`.
pub const COLOR_SUM_SOURCE: &str = "struct color {\n\
    \x20   float r;\n\
    \x20   float g;\n\
    \x20   float b;\n\
    };\n\
    \n\
    __kernel void entry_point(__global int *C, struct color c, __global float *out) {\n\
    \x20   int i = get_global_id(0);\n\
    \x20   int j = get_global_id(1);\n\
    \n\
    \x20   C[i + 8 * j] = (i << 8 | j);\n\
    \n\
    \x20   if (i == 0 && j == 0) {\n\
    \x20       *out = c.r + c.g + c.b;\n\
    \x20   }\n\
    }\n";

/// Host mirror of the kernel's `struct color`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    /// Native-endian bytes in field order, as the kernel receives them.
    pub fn to_ne_bytes(self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        for (chunk, value) in bytes.chunks_exact_mut(4).zip([self.r, self.g, self.b]) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
        bytes
    }
}

impl std::str::FromStr for Color {
    type Err = String;

    /// Parses `r,g,b`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let channels = s
            .split(',')
            .map(|part| part.trim().parse::<f32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid color '{}': {}", s, e))?;
        match channels[..] {
            [r, g, b] => Ok(Color::new(r, g, b)),
            _ => Err(format!("color '{}' needs three channels r,g,b", s)),
        }
    }
}

/// Program text as submitted to a platform compiler.
///
/// The text is held NUL-terminated; its submitted length is `strlen + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    text: CString,
}

impl KernelSource {
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = CString::new(text.into()).map_err(|e| {
            Error::config(format!("kernel source has a NUL at byte {}", e.nul_position()))
        })?;
        Ok(Self { text })
    }

    /// The embedded packed-index program.
    pub fn packed_index() -> Self {
        Self {
            text: CString::new(PACKED_INDEX_SOURCE).unwrap_or_default(),
        }
    }

    /// The embedded packed-index program with the color reduction.
    pub fn color_sum() -> Self {
        Self {
            text: CString::new(COLOR_SUM_SOURCE).unwrap_or_default(),
        }
    }

    pub fn as_str(&self) -> &str {
        self.text.to_str().unwrap_or_default()
    }

    /// Text plus its terminating NUL.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        self.text.as_bytes_with_nul()
    }

    /// Length handed to the platform: text bytes plus the terminator.
    pub fn submitted_len(&self) -> usize {
        self.text.as_bytes_with_nul().len()
    }
}

/// A decoded `(i << 8) | j` cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedIndex {
    pub i: u8,
    pub j: u8,
}

impl PackedIndex {
    pub fn encode(i: usize, j: usize) -> u32 {
        ((i as u32) << 8) | j as u32
    }

    pub fn decode(value: u32) -> Self {
        Self {
            i: ((value >> 8) & 0xff) as u8,
            j: (value & 0xff) as u8,
        }
    }
}

/// Host copy of a 2-D result buffer, stored with `i` varying fastest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultGrid {
    width: usize,
    height: usize,
    cells: Vec<u32>,
}

impl ResultGrid {
    pub fn new(width: usize, height: usize, cells: Vec<u32>) -> Result<Self> {
        if width.checked_mul(height) != Some(cells.len()) {
            return Err(Error::config(format!(
                "grid of {}x{} does not hold {} cells",
                width,
                height,
                cells.len()
            )));
        }
        Ok(Self {
            width,
            height,
            cells,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Value at global id `(i, j)`, i.e. position `i + width * j`.
    pub fn get(&self, i: usize, j: usize) -> Option<u32> {
        if i >= self.width || j >= self.height {
            return None;
        }
        self.cells.get(i + self.width * j).copied()
    }

    pub fn cells(&self) -> &[u32] {
        &self.cells
    }

    /// Row `i` holds the cells for `j = 0..height`.
    pub fn row(&self, i: usize) -> impl Iterator<Item = u32> + '_ {
        (0..self.height).filter_map(move |j| self.get(i, j))
    }

    /// Positions whose value is not the packed index of `(i, j)`.
    pub fn packed_index_mismatches(&self) -> Vec<(usize, usize, u32)> {
        let mut out = Vec::new();
        for j in 0..self.height {
            for i in 0..self.width {
                let value = self.cells[i + self.width * j];
                if value != PackedIndex::encode(i, j) {
                    out.push((i, j, value));
                }
            }
        }
        out
    }
}

impl fmt::Display for ResultGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.width {
            for value in self.row(i) {
                write!(f, "0x{:x} ", value)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submitted_length_counts_terminator() {
        let source = KernelSource::packed_index();
        assert_eq!(source.submitted_len(), PACKED_INDEX_SOURCE.len() + 1);
        assert_eq!(source.as_bytes_with_nul().last(), Some(&0));
        assert!(source.as_str().contains(ENTRY_POINT));
    }

    #[test]
    fn test_color_layout() {
        assert_eq!(std::mem::size_of::<Color>(), 12);
        let bytes = Color::new(0.1, 1.0, 10.0).to_ne_bytes();
        assert_eq!(&bytes[4..8], &1.0f32.to_ne_bytes());
        assert!(KernelSource::color_sum().as_str().contains("struct color c"));
    }

    #[test]
    fn test_color_from_str() {
        assert_eq!("0.5, 1,2.25".parse::<Color>(), Ok(Color::new(0.5, 1.0, 2.25)));
        assert!("1,2".parse::<Color>().is_err());
        assert!("1,x,2".parse::<Color>().is_err());
    }

    #[test]
    fn test_interior_nul_rejected() {
        assert!(KernelSource::new("__kernel\0void").is_err());
    }

    #[test]
    fn test_packed_index() {
        assert_eq!(PackedIndex::encode(0, 0), 0x0000);
        assert_eq!(PackedIndex::encode(1, 1), 0x0101);
        assert_eq!(PackedIndex::encode(7, 7), 0x0707);
        assert_eq!(PackedIndex::decode(0x0503), PackedIndex { i: 5, j: 3 });
    }

    #[test]
    fn test_grid_layout() {
        let cells: Vec<u32> = (0..64)
            .map(|pos| PackedIndex::encode(pos % 8, pos / 8))
            .collect();
        let grid = ResultGrid::new(8, 8, cells).unwrap();
        assert_eq!(grid.get(1, 1), Some(0x0101));
        assert_eq!(grid.cells()[9], 0x0101);
        assert_eq!(grid.cells()[63], 0x0707);
        assert!(grid.packed_index_mismatches().is_empty());

        let first_row: Vec<u32> = grid.row(0).collect();
        assert_eq!(first_row, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(grid.to_string().starts_with("0x0 0x1 0x2"));
        assert!(ResultGrid::new(8, 8, vec![0; 3]).is_err());
    }
}
