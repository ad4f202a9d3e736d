//! The tilted-ring model: one ring per annulus, ordered innermost to
//! outermost.

use thiserror::Error;

/// One annulus of the tilted-ring model.
///
/// Radii, widths and scale heights are arcsec; positions are pixels;
/// velocities are km/s; angles are degrees; `dens` is a face-on column
/// density in atoms/cm^2.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ring {
    pub radius: f64,
    pub width: f64,
    pub xpos: f64,
    pub ypos: f64,
    pub vsys: f64,
    pub vrot: f64,
    pub vdisp: f64,
    pub vrad: f64,
    pub inc: f64,
    pub pa: f64,
    pub z0: f64,
    pub dens: f64,
}

impl Ring {
    fn check(&self, index: usize) -> Result<(), RingError> {
        if !(self.width > 0.0) {
            return Err(RingError::BadWidth {
                index,
                width: self.width,
            });
        }
        if !(0.0..=90.0).contains(&self.inc) {
            return Err(RingError::BadInclination {
                index,
                inc: self.inc,
            });
        }
        if !(0.0..360.0).contains(&self.pa) {
            return Err(RingError::BadPositionAngle { index, pa: self.pa });
        }
        if !(self.vdisp > 0.0) {
            return Err(RingError::BadDispersion {
                index,
                vdisp: self.vdisp,
            });
        }
        if self.z0 < 0.0 {
            return Err(RingError::BadScaleHeight { index, z0: self.z0 });
        }
        Ok(())
    }

    /// Area of the annulus in arcsec^2.
    pub fn area(&self) -> f64 {
        2.0 * std::f64::consts::PI * self.radius * self.width
    }

    /// Inner and outer radius of the annulus in arcsec.
    pub fn bounds(&self) -> (f64, f64) {
        ((self.radius - 0.5 * self.width).max(0.0), self.radius + 0.5 * self.width)
    }
}

/// A parameter of a ring that the fitter may treat as free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FitParam {
    VRot,
    VDisp,
    VRad,
    Inc,
    Pa,
    XPos,
    YPos,
    VSys,
    Z0,
}

impl FitParam {
    pub const ALL: [FitParam; 9] = [
        FitParam::VRot,
        FitParam::VDisp,
        FitParam::VRad,
        FitParam::Inc,
        FitParam::Pa,
        FitParam::XPos,
        FitParam::YPos,
        FitParam::VSys,
        FitParam::Z0,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FitParam::VRot => "VROT",
            FitParam::VDisp => "VDISP",
            FitParam::VRad => "VRAD",
            FitParam::Inc => "INC",
            FitParam::Pa => "PA",
            FitParam::XPos => "XPOS",
            FitParam::YPos => "YPOS",
            FitParam::VSys => "VSYS",
            FitParam::Z0 => "Z0",
        }
    }

    pub fn parse(name: &str) -> Option<FitParam> {
        match name.trim().to_ascii_uppercase().as_str() {
            "VROT" => Some(FitParam::VRot),
            "VDISP" | "DISP" => Some(FitParam::VDisp),
            "VRAD" => Some(FitParam::VRad),
            "INC" => Some(FitParam::Inc),
            "PA" | "PHI" => Some(FitParam::Pa),
            "XPOS" => Some(FitParam::XPos),
            "YPOS" => Some(FitParam::YPos),
            "VSYS" => Some(FitParam::VSys),
            "Z0" => Some(FitParam::Z0),
            _ => None,
        }
    }

    /// True for the parameters describing the projection geometry rather
    /// than the gas kinematics. These are the ones usually regularised in
    /// the second fitting pass.
    pub fn is_geometric(&self) -> bool {
        matches!(
            self,
            FitParam::Inc
                | FitParam::Pa
                | FitParam::XPos
                | FitParam::YPos
                | FitParam::VSys
                | FitParam::Z0
        )
    }

    pub fn get(&self, ring: &Ring) -> f64 {
        match self {
            FitParam::VRot => ring.vrot,
            FitParam::VDisp => ring.vdisp,
            FitParam::VRad => ring.vrad,
            FitParam::Inc => ring.inc,
            FitParam::Pa => ring.pa,
            FitParam::XPos => ring.xpos,
            FitParam::YPos => ring.ypos,
            FitParam::VSys => ring.vsys,
            FitParam::Z0 => ring.z0,
        }
    }

    pub fn set(&self, ring: &mut Ring, value: f64) {
        match self {
            FitParam::VRot => ring.vrot = value,
            FitParam::VDisp => ring.vdisp = value,
            FitParam::VRad => ring.vrad = value,
            FitParam::Inc => ring.inc = value,
            FitParam::Pa => ring.pa = value,
            FitParam::XPos => ring.xpos = value,
            FitParam::YPos => ring.ypos = value,
            FitParam::VSys => ring.vsys = value,
            FitParam::Z0 => ring.z0 = value,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RingError {
    #[error("ring set is empty")]
    Empty,
    #[error("ring {index}: width must be positive, got {width}")]
    BadWidth { index: usize, width: f64 },
    #[error("ring {index}: inclination {inc} outside [0, 90]")]
    BadInclination { index: usize, inc: f64 },
    #[error("ring {index}: position angle {pa} outside [0, 360)")]
    BadPositionAngle { index: usize, pa: f64 },
    #[error("ring {index}: velocity dispersion must be positive, got {vdisp}")]
    BadDispersion { index: usize, vdisp: f64 },
    #[error("ring {index}: scale height must be non-negative, got {z0}")]
    BadScaleHeight { index: usize, z0: f64 },
    #[error("ring radii must be strictly increasing (ring {index}: {prev} then {next})")]
    NonMonotonicRadii { index: usize, prev: f64, next: f64 },
}

/// Ordered sequence of rings, innermost first, strictly increasing radii.
#[derive(Debug, Clone, PartialEq)]
pub struct RingSet {
    rings: Vec<Ring>,
}

impl RingSet {
    pub fn new(rings: Vec<Ring>) -> Result<Self, RingError> {
        if rings.is_empty() {
            return Err(RingError::Empty);
        }
        for (i, ring) in rings.iter().enumerate() {
            ring.check(i)?;
            if i > 0 && rings[i - 1].radius >= ring.radius {
                return Err(RingError::NonMonotonicRadii {
                    index: i,
                    prev: rings[i - 1].radius,
                    next: ring.radius,
                });
            }
        }
        Ok(RingSet { rings })
    }

    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }

    pub fn get(&self, i: usize) -> &Ring {
        &self.rings[i]
    }

    pub fn get_mut(&mut self, i: usize) -> &mut Ring {
        &mut self.rings[i]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Ring> {
        self.rings.iter()
    }

    pub fn rings(&self) -> &[Ring] {
        &self.rings
    }

    pub fn radii(&self) -> Vec<f64> {
        self.rings.iter().map(|r| r.radius).collect()
    }

    /// Values of one parameter across all rings.
    pub fn profile(&self, param: FitParam) -> Vec<f64> {
        self.rings.iter().map(|r| param.get(r)).collect()
    }
}
