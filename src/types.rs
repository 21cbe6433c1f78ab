// Lengths are integer micrometres so that millimetre inputs add up exactly
// during pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Mm(i64);

const UM_PER_MM: i64 = 1000;
const PT_PER_MM: f64 = 72.0 / 25.4;
// CSS reference pixel: 96 per inch.
const PX_PER_MM: f64 = 96.0 / 25.4;

impl Mm {
    pub const ZERO: Mm = Mm(0);

    pub fn new(mm: i32) -> Mm {
        Mm(mm as i64 * UM_PER_MM)
    }

    pub fn from_f32(mm: f32) -> Mm {
        if !mm.is_finite() {
            return Mm::ZERO;
        }
        let um = (mm as f64 * UM_PER_MM as f64).round();
        Mm(um.clamp(i64::MIN as f64, i64::MAX as f64) as i64)
    }

    pub fn from_um(um: i64) -> Mm {
        Mm(um)
    }

    pub fn from_px(px: f32) -> Mm {
        if !px.is_finite() {
            return Mm::ZERO;
        }
        Mm::from_f32((px as f64 / PX_PER_MM) as f32)
    }

    pub fn to_um(self) -> i64 {
        self.0
    }

    pub fn to_f32(self) -> f32 {
        (self.0 as f64 / UM_PER_MM as f64) as f32
    }

    pub fn to_pt(self) -> f32 {
        (self.0 as f64 / UM_PER_MM as f64 * PT_PER_MM) as f32
    }

    // CSS pixels at 1x; multiply by the raster scale for device pixels.
    pub fn to_px(self) -> f32 {
        (self.0 as f64 / UM_PER_MM as f64 * PX_PER_MM) as f32
    }

    /// Whole device pixels at `scale`. Every raster surface sizes itself
    /// through this so page canvases and section bands line up exactly.
    pub fn to_device_px(self, scale: f32) -> u32 {
        let px = (self.to_px() * scale).round();
        if px.is_finite() && px > 0.0 {
            px as u32
        } else {
            0
        }
    }

    pub fn max(self, other: Mm) -> Mm {
        if self >= other { self } else { other }
    }

    pub fn min(self, other: Mm) -> Mm {
        if self <= other { self } else { other }
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn mul_ratio(self, num: i64, denom: i64) -> Mm {
        if denom == 0 {
            return Mm::ZERO;
        }
        Mm(div_round_i128(self.0 as i128 * num as i128, denom as i128) as i64)
    }

    // Number of `unit`-sized pieces needed to hold `self`, rounding up.
    pub fn ceil_div(self, unit: Mm) -> usize {
        if unit.0 <= 0 || self.0 <= 0 {
            return 0;
        }
        ((self.0 + unit.0 - 1) / unit.0) as usize
    }
}

impl std::ops::Add for Mm {
    type Output = Mm;
    fn add(self, rhs: Mm) -> Mm {
        Mm(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::AddAssign for Mm {
    fn add_assign(&mut self, rhs: Mm) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for Mm {
    type Output = Mm;
    fn sub(self, rhs: Mm) -> Mm {
        Mm(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::SubAssign for Mm {
    fn sub_assign(&mut self, rhs: Mm) {
        *self = *self - rhs;
    }
}

impl std::ops::Mul<i32> for Mm {
    type Output = Mm;
    fn mul(self, rhs: i32) -> Mm {
        Mm(self.0.saturating_mul(rhs as i64))
    }
}

impl std::ops::Div<i32> for Mm {
    type Output = Mm;
    fn div(self, rhs: i32) -> Mm {
        if rhs == 0 {
            Mm::ZERO
        } else {
            Mm(div_round_i128(self.0 as i128, rhs as i128) as i64)
        }
    }
}

fn div_round_i128(num: i128, den: i128) -> i128 {
    if den == 0 {
        return 0;
    }
    let den_abs = den.abs();
    if num >= 0 {
        (num + (den_abs / 2)) / den
    } else {
        -(((-num) + (den_abs / 2)) / den)
    }
}

impl std::iter::Sum for Mm {
    fn sum<I: Iterator<Item = Mm>>(iter: I) -> Mm {
        iter.fold(Mm::ZERO, |acc, v| acc + v)
    }
}

impl<'a> std::iter::Sum<&'a Mm> for Mm {
    fn sum<I: Iterator<Item = &'a Mm>>(iter: I) -> Mm {
        iter.fold(Mm::ZERO, |acc, v| acc + *v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: Mm,
    pub height: Mm,
}

impl Size {
    pub fn a4() -> Self {
        Self {
            width: Mm::new(210),
            height: Mm::new(297),
        }
    }

    pub fn letter() -> Self {
        // 8.5in x 11in.
        Self {
            width: Mm::from_f32(215.9),
            height: Mm::from_f32(279.4),
        }
    }

    pub fn from_mm(width_mm: f32, height_mm: f32) -> Self {
        Self {
            width: Mm::from_f32(width_mm),
            height: Mm::from_f32(height_mm),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: Mm,
    pub y: Mm,
    pub width: Mm,
    pub height: Mm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Margins {
    pub top: Mm,
    pub right: Mm,
    pub bottom: Mm,
    pub left: Mm,
}

impl Margins {
    pub fn all(value: Mm) -> Self {
        Self {
            top: value,
            right: value,
            bottom: value,
            left: value,
        }
    }
}

/// Physical page plus margins. The usable box is what the planner and the
/// rasterizer fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub size: Size,
    pub margins: Margins,
}

impl PageGeometry {
    pub fn new(size: Size, margins: Margins) -> Self {
        Self { size, margins }
    }

    pub fn a4() -> Self {
        Self::new(Size::a4(), Margins::all(Mm::new(10)))
    }

    pub fn usable_width(&self) -> Mm {
        (self.size.width - self.margins.left - self.margins.right).max(Mm::ZERO)
    }

    pub fn usable_height(&self) -> Mm {
        (self.size.height - self.margins.top - self.margins.bottom).max(Mm::ZERO)
    }

    pub fn usable_rect(&self) -> Rect {
        Rect {
            x: self.margins.left,
            y: self.margins.top,
            width: self.usable_width(),
            height: self.usable_height(),
        }
    }
}

impl Default for PageGeometry {
    fn default() -> Self {
        Self::a4()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const BLACK: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
    };

    pub const WHITE: Color = Color {
        r: 1.0,
        g: 1.0,
        b: 1.0,
    };

    pub fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }
}
