//! Packed 4:2:2 → planar 4:2:0

use serde::{Deserialize, Serialize};

use crate::convert::{ExcessColumns, RowOrder};

/// How one chroma value is taken from each 2×2 block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChromaSampling {
    /// Rounded mean of the block's two rows
    #[default]
    Average,
    /// Top row only
    TopRow,
}

/// Byte offsets and strides of the three planes inside one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub y_stride: usize,
    pub chroma_stride: usize,
    pub height: usize,
    pub u_offset: usize,
    pub v_offset: usize,
    pub len: usize,
}

impl PlaneLayout {
    pub fn new(y_stride: usize, chroma_stride: usize, height: usize) -> Self {
        let chroma_rows = height.div_ceil(2);
        let u_offset = y_stride * height;
        let v_offset = u_offset + chroma_stride * chroma_rows;
        Self {
            y_stride,
            chroma_stride,
            height,
            u_offset,
            v_offset,
            len: v_offset + chroma_stride * chroma_rows,
        }
    }

    /// Tightly packed planes for a `width`×`height` image
    pub fn tight(width: usize, height: usize) -> Self {
        Self::new(width, width.div_ceil(2), height)
    }

    pub fn chroma_rows(&self) -> usize {
        self.height.div_ceil(2)
    }
}

/// Mutable views of the Y, U and V planes of one buffer
pub struct Planes<'a> {
    pub y: &'a mut [u8],
    pub u: &'a mut [u8],
    pub v: &'a mut [u8],
}

impl<'a> Planes<'a> {
    /// Split `buf`, which must hold at least `layout.len` bytes
    pub fn split(buf: &'a mut [u8], layout: &PlaneLayout) -> Self {
        let (y, chroma) = buf[..layout.len].split_at_mut(layout.u_offset);
        let (u, v) = chroma.split_at_mut(layout.v_offset - layout.u_offset);
        Self { y, u, v }
    }
}

pub(crate) struct PlanarJob<'s> {
    pub src: &'s [u8],
    pub src_stride: usize,
    pub width: usize,
    pub height: usize,
    pub surface_width: usize,
    pub row_order: RowOrder,
    pub excess: ExcessColumns,
    pub chroma: ChromaSampling,
}

impl PlanarJob<'_> {
    pub fn run(&self, planes: Planes<'_>, layout: &PlaneLayout) {
        let Planes { y: y_plane, u: u_plane, v: v_plane } = planes;
        let pairs = self.width / 2;

        for row in 0..self.height {
            let src = &self.src[row * self.src_stride..][..self.width * 2];
            let out = self.row_order.target(row, self.height) * layout.y_stride;
            let dst = &mut y_plane[out..out + layout.y_stride];
            for (pixel, sample) in src.iter().step_by(2).enumerate() {
                dst[pixel] = *sample;
            }
            if self.excess == ExcessColumns::Clear {
                dst[self.width..self.surface_width].fill(0);
            }
        }

        // blocks pair destination rows, so a flipped odd-height image keeps
        // each chroma row with the luma rows stored next to it
        let chroma_rows = self.height.div_ceil(2);
        for block in 0..chroma_rows {
            let source_row = move |row: usize| {
                let at = self.row_order.target(row, self.height) * self.src_stride;
                &self.src[at..][..self.width * 2]
            };
            let top = source_row(2 * block);
            let bottom = match self.chroma {
                ChromaSampling::Average if 2 * block + 1 < self.height => source_row(2 * block + 1),
                _ => top,
            };
            let out = block * layout.chroma_stride;
            let u_row = &mut u_plane[out..out + layout.chroma_stride];
            let v_row = &mut v_plane[out..out + layout.chroma_stride];
            for pair in 0..pairs {
                let at = pair * 4;
                u_row[pair] = ((top[at + 1] as u16 + bottom[at + 1] as u16 + 1) >> 1) as u8;
                v_row[pair] = ((top[at + 3] as u16 + bottom[at + 3] as u16 + 1) >> 1) as u8;
            }
            if self.excess == ExcessColumns::Clear {
                let surface_pairs = self.surface_width.div_ceil(2);
                u_row[pairs..surface_pairs].fill(128);
                v_row[pairs..surface_pairs].fill(128);
            }
        }

        if self.excess == ExcessColumns::Clear {
            y_plane[self.height * layout.y_stride..].fill(0);
            u_plane[chroma_rows * layout.chroma_stride..].fill(128);
            v_plane[chroma_rows * layout.chroma_stride..].fill(128);
        }
    }
}
