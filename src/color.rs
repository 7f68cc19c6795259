//! Colour Types
//!
//! Working colours are RGBT: red, green, blue plus a transmittance channel
//! used for alpha compositing. Single-precision is sufficient for pixel
//! output; the stochastic sampler accumulates in double precision to keep
//! variance estimates stable over hundreds of samples.

use std::ops::{Add, AddAssign, Div, DivAssign, Mul, Sub};

/// An RGBT pixel colour.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RgbtColour {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
    pub transm: f32,
}

impl RgbtColour {
    #[must_use]
    pub const fn new(red: f32, green: f32, blue: f32, transm: f32) -> Self {
        Self {
            red,
            green,
            blue,
            transm,
        }
    }

    #[must_use]
    pub const fn rgb(red: f32, green: f32, blue: f32) -> Self {
        Self::new(red, green, blue, 0.0)
    }
}

impl Add for RgbtColour {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.red + rhs.red,
            self.green + rhs.green,
            self.blue + rhs.blue,
            self.transm + rhs.transm,
        )
    }
}

impl AddAssign for RgbtColour {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Mul<f32> for RgbtColour {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(
            self.red * rhs,
            self.green * rhs,
            self.blue * rhs,
            self.transm * rhs,
        )
    }
}

impl Div<f32> for RgbtColour {
    type Output = Self;
    fn div(self, rhs: f32) -> Self {
        Self::new(
            self.red / rhs,
            self.green / rhs,
            self.blue / rhs,
            self.transm / rhs,
        )
    }
}

impl DivAssign<f32> for RgbtColour {
    fn div_assign(&mut self, rhs: f32) {
        *self = *self / rhs;
    }
}

/// Manhattan distance over all four channels, as used by the antialiasing
/// threshold tests.
#[must_use]
pub fn colour_distance(a: RgbtColour, b: RgbtColour) -> f32 {
    (a.red - b.red).abs()
        + (a.green - b.green).abs()
        + (a.blue - b.blue).abs()
        + (a.transm - b.transm).abs()
}

/// An RGB light colour (no transmittance channel); photon energies.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RgbColour {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

impl RgbColour {
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0);

    #[must_use]
    pub const fn new(red: f32, green: f32, blue: f32) -> Self {
        Self { red, green, blue }
    }
}

impl Mul<f32> for RgbColour {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.red * rhs, self.green * rhs, self.blue * rhs)
    }
}

/// Double-precision RGBT accumulator for the stochastic sampler.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PreciseRgbt {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    pub transm: f64,
}

impl PreciseRgbt {
    #[must_use]
    pub fn sqr(self) -> Self {
        Self {
            red: self.red * self.red,
            green: self.green * self.green,
            blue: self.blue * self.blue,
            transm: self.transm * self.transm,
        }
    }

    #[must_use]
    pub fn sqrt(self) -> Self {
        Self {
            red: self.red.max(0.0).sqrt(),
            green: self.green.max(0.0).sqrt(),
            blue: self.blue.max(0.0).sqrt(),
            transm: self.transm.max(0.0).sqrt(),
        }
    }

    /// Channel sum, used for the combined confidence-delta test.
    #[must_use]
    pub fn sum(self) -> f64 {
        self.red + self.green + self.blue + self.transm
    }
}

impl From<RgbtColour> for PreciseRgbt {
    fn from(c: RgbtColour) -> Self {
        Self {
            red: f64::from(c.red),
            green: f64::from(c.green),
            blue: f64::from(c.blue),
            transm: f64::from(c.transm),
        }
    }
}

impl Add for PreciseRgbt {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            red: self.red + rhs.red,
            green: self.green + rhs.green,
            blue: self.blue + rhs.blue,
            transm: self.transm + rhs.transm,
        }
    }
}

impl AddAssign for PreciseRgbt {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for PreciseRgbt {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            red: self.red - rhs.red,
            green: self.green - rhs.green,
            blue: self.blue - rhs.blue,
            transm: self.transm - rhs.transm,
        }
    }
}

impl Mul<f64> for PreciseRgbt {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        Self {
            red: self.red * rhs,
            green: self.green * rhs,
            blue: self.blue * rhs,
            transm: self.transm * rhs,
        }
    }
}

impl Div<f64> for PreciseRgbt {
    type Output = Self;
    fn div(self, rhs: f64) -> Self {
        Self {
            red: self.red / rhs,
            green: self.green / rhs,
            blue: self.blue / rhs,
            transm: self.transm / rhs,
        }
    }
}

/// A power-law encoding curve composed with the working gamma.
///
/// Applied to colours before antialiasing distance tests so that threshold
/// comparisons happen in a perceptually even space. `IDENTITY` disables the
/// encoding (an antialias gamma of zero).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GammaCurve {
    decoding_gamma: Option<f32>,
}

impl GammaCurve {
    pub const IDENTITY: Self = Self {
        decoding_gamma: None,
    };

    /// Power-law curve; `gamma` must be positive.
    #[must_use]
    pub fn power_law(gamma: f32) -> Self {
        if gamma > 0.0 {
            Self {
                decoding_gamma: Some(gamma),
            }
        } else {
            Self::IDENTITY
        }
    }

    /// Encodes a colour through the curve, channel by channel.
    ///
    /// Negative channel values are clamped to zero before the power is
    /// taken; the transmittance channel passes through unencoded.
    #[must_use]
    pub fn encode(&self, c: RgbtColour) -> RgbtColour {
        match self.decoding_gamma {
            None => c,
            Some(g) => {
                let e = 1.0 / g;
                RgbtColour::new(
                    c.red.max(0.0).powf(e),
                    c.green.max(0.0).powf(e),
                    c.blue.max(0.0).powf(e),
                    c.transm,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_covers_all_channels() {
        let a = RgbtColour::new(0.1, 0.2, 0.3, 0.4);
        let b = RgbtColour::new(0.2, 0.2, 0.1, 0.5);
        let d = colour_distance(a, b);
        assert!((d - 0.4).abs() < 1e-6);
    }

    #[test]
    fn identity_gamma_is_a_no_op() {
        let c = RgbtColour::new(0.25, 0.5, 0.75, 0.1);
        assert_eq!(GammaCurve::IDENTITY.encode(c), c);
    }

    #[test]
    fn power_law_encodes_rgb_only() {
        let curve = GammaCurve::power_law(2.0);
        let c = curve.encode(RgbtColour::new(0.25, 1.0, 0.0, 0.3));
        assert!((c.red - 0.5).abs() < 1e-6);
        assert!((c.green - 1.0).abs() < 1e-6);
        assert!((c.blue).abs() < 1e-6);
        assert!((c.transm - 0.3).abs() < 1e-6);
    }

    #[test]
    fn precise_variance_building_blocks() {
        let x = PreciseRgbt {
            red: 4.0,
            green: 9.0,
            blue: 0.0,
            transm: 1.0,
        };
        let r = x.sqrt();
        assert!((r.red - 2.0).abs() < 1e-12);
        assert!((r.green - 3.0).abs() < 1e-12);
        assert!((x.sum() - 14.0).abs() < 1e-12);
    }
}
