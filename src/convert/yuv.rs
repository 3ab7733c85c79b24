//! Integer BT.601 colour math

use serde::{Deserialize, Serialize};

/// YUV → RGB coefficient set, all scaled by 256
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Coefficients {
    /// `298*y`, `409*v`, `100*u`, `208*v`, `516*u`
    #[default]
    Bt601,
    /// Full-swing luma: `256*y`, `359*v`, `88*u`, `183*v`, `454*u`
    Bt601Full,
}

impl Coefficients {
    /// (y, r←v, g←u, g←v, b←u)
    const fn factors(self) -> (i32, i32, i32, i32, i32) {
        match self {
            Coefficients::Bt601 => (298, 409, 100, 208, 516),
            Coefficients::Bt601Full => (256, 359, 88, 183, 454),
        }
    }
}

#[inline]
pub fn clip(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Per-sample products precomputed for one coefficient set
#[derive(Clone)]
pub struct YuvTables {
    y: [i32; 256],
    rv: [i32; 256],
    gu: [i32; 256],
    gv: [i32; 256],
    bu: [i32; 256],
}

impl YuvTables {
    pub fn new(coefficients: Coefficients) -> Self {
        let (ky, krv, kgu, kgv, kbu) = coefficients.factors();
        let mut tables = Self {
            y: [0; 256],
            rv: [0; 256],
            gu: [0; 256],
            gv: [0; 256],
            bu: [0; 256],
        };
        for sample in 0..256 {
            let centred = sample as i32 - 128;
            tables.y[sample] = ky * sample as i32 + 128;
            tables.rv[sample] = krv * centred;
            tables.gu[sample] = kgu * centred;
            tables.gv[sample] = kgv * centred;
            tables.bu[sample] = kbu * centred;
        }
        tables
    }

    /// One luma sample with the chroma pair it shares, `u`/`v` as stored (offset 128)
    #[inline]
    pub fn rgb(&self, y: u8, u: u8, v: u8) -> [u8; 3] {
        let y = self.y[y as usize];
        [
            clip((y + self.rv[v as usize]) >> 8),
            clip((y - self.gu[u as usize] - self.gv[v as usize]) >> 8),
            clip((y + self.bu[u as usize]) >> 8),
        ]
    }
}

/// Direct evaluation without tables
pub fn yuv_to_rgb(y: u8, u: u8, v: u8, coefficients: Coefficients) -> [u8; 3] {
    let (ky, krv, kgu, kgv, kbu) = coefficients.factors();
    let y = ky * y as i32;
    let u = u as i32 - 128;
    let v = v as i32 - 128;
    [
        clip((y + krv * v + 128) >> 8),
        clip((y - kgu * u - kgv * v + 128) >> 8),
        clip((y + kbu * u + 128) >> 8),
    ]
}

#[inline]
pub fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

/// Expand RGB565 to the centre of each quantisation bucket
#[inline]
pub fn unpack_rgb565(pixel: u16) -> [u8; 3] {
    let r = (pixel >> 11) as u8 & 0x1f;
    let g = (pixel >> 5) as u8 & 0x3f;
    let b = pixel as u8 & 0x1f;
    [(r << 3) | 3, (g << 2) | 2, (b << 3) | 3]
}

/// BT.601 luma of an RGB triple
#[inline]
pub fn rgb_to_luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32 + 128) >> 8) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gray_full_range() {
        assert_eq!(yuv_to_rgb(128, 128, 128, Coefficients::Bt601Full), [128, 128, 128]);
        let tables = YuvTables::new(Coefficients::Bt601Full);
        assert_eq!(tables.rgb(128, 128, 128), [128, 128, 128]);
    }

    #[test]
    fn test_gray_default_formula() {
        // (298 * 128 + 128) >> 8
        assert_eq!(yuv_to_rgb(128, 128, 128, Coefficients::Bt601), [149, 149, 149]);
    }

    #[test]
    fn test_tables_match_direct_formula() {
        for coefficients in [Coefficients::Bt601, Coefficients::Bt601Full] {
            let tables = YuvTables::new(coefficients);
            for y in (0..=255u8).step_by(5) {
                for u in (0..=255u8).step_by(17) {
                    for v in (0..=255u8).step_by(15) {
                        assert_eq!(tables.rgb(y, u, v), yuv_to_rgb(y, u, v, coefficients));
                    }
                }
            }
        }
    }

    #[test]
    fn test_clips_instead_of_wrapping() {
        assert_eq!(yuv_to_rgb(255, 255, 255, Coefficients::Bt601), [255, 144, 255]);
        assert_eq!(yuv_to_rgb(0, 0, 0, Coefficients::Bt601), [0, 154, 0]);
        assert_eq!(clip(-7), 0);
        assert_eq!(clip(300), 255);
    }

    #[test]
    fn test_rgb565_packing() {
        assert_eq!(pack_rgb565(255, 255, 255), 0xffff);
        assert_eq!(pack_rgb565(255, 0, 0), 0xf800);
        assert_eq!(pack_rgb565(0, 255, 0), 0x07e0);
        assert_eq!(pack_rgb565(0, 0, 255), 0x001f);
        assert_eq!(unpack_rgb565(0x0000), [3, 2, 3]);
        assert_eq!(unpack_rgb565(0xffff), [251, 254, 251]);
    }
}
