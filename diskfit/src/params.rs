//! The key/value parameter file driving a run.
//!
//! One `KEY value` pair per line, `#` starts a comment, keys are
//! case-insensitive. Every recognised key has a default, so an empty file
//! (plus a FITS path) is a valid automatic run. Reading a file, writing it
//! back and reading it again preserves every recognised key.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

use galfit::{FType, MaskKind, Side, WFunc};
use galmod::{Ltype, Normalisation};
use shared::rings::FitParam;

#[derive(Error, Debug)]
pub enum ParamError {
    #[error("cannot read parameter file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parameter {key}: invalid value '{value}'")]
    BadValue { key: String, value: String },
}

/// A per-ring quantity: estimated automatically, fixed to one value, or
/// read from a profile file (one value per ring).
#[derive(Debug, Clone, PartialEq)]
pub enum RingValue {
    Auto,
    Value(f64),
    File(PathBuf),
}

impl RingValue {
    pub fn is_auto(&self) -> bool {
        matches!(self, RingValue::Auto)
    }
}

impl FromStr for RingValue {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("auto") {
            Ok(RingValue::Auto)
        } else if let Ok(v) = t.parse::<f64>() {
            Ok(RingValue::Value(v))
        } else {
            Ok(RingValue::File(PathBuf::from(t)))
        }
    }
}

impl fmt::Display for RingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingValue::Auto => write!(f, "auto"),
            RingValue::Value(v) => write!(f, "{v}"),
            RingValue::File(p) => write!(f, "{}", p.display()),
        }
    }
}

/// All recognised parameters with their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub fitsfile: Option<PathBuf>,
    pub nradii: Option<usize>,
    pub radsep: Option<f64>,
    pub xpos: RingValue,
    pub ypos: RingValue,
    pub vsys: RingValue,
    pub vrot: RingValue,
    pub vdisp: RingValue,
    pub vrad: RingValue,
    pub inc: RingValue,
    pub pa: RingValue,
    pub z0: RingValue,
    pub dens: RingValue,
    pub free: Vec<FitParam>,
    pub ftype: FType,
    pub wfunc: WFunc,
    pub norm: Normalisation,
    pub ltype: Ltype,
    pub cdens: f64,
    pub nv: i64,
    pub tol: f64,
    pub mask: MaskSpec,
    pub side: Side,
    pub two_stage: bool,
    pub polyn: i32,
    pub flag_errors: bool,
    pub threads: usize,
    pub outfolder: PathBuf,
    /// Absolute flux value used when `MASK threshold` is selected.
    pub threshold: f64,
    /// Primary S/N cut of the source finder.
    pub snr_cut: f64,
    /// Growth S/N cut of the source finder.
    pub growth_cut: f64,
}

/// Mask selection keyword; the threshold value lives in
/// [`Params::threshold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskSpec {
    Smooth,
    Search,
    Both,
    Threshold,
    Negative,
    None,
}

impl MaskSpec {
    fn parse(s: &str) -> Option<MaskSpec> {
        match s.to_ascii_lowercase().as_str() {
            "smooth" => Some(MaskSpec::Smooth),
            "search" => Some(MaskSpec::Search),
            "both" => Some(MaskSpec::Both),
            "threshold" => Some(MaskSpec::Threshold),
            "negative" => Some(MaskSpec::Negative),
            "none" => Some(MaskSpec::None),
            _ => None,
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            MaskSpec::Smooth => "smooth",
            MaskSpec::Search => "search",
            MaskSpec::Both => "both",
            MaskSpec::Threshold => "threshold",
            MaskSpec::Negative => "negative",
            MaskSpec::None => "none",
        }
    }

    pub fn to_mask_kind(self, threshold: f64) -> MaskKind {
        match self {
            MaskSpec::Smooth => MaskKind::Smoothing {
                factor: 2.0,
                snr_cut: 3.0,
            },
            MaskSpec::Search => MaskKind::Searching,
            MaskSpec::Both => MaskKind::SmoothAndSearch { factor: 2.0 },
            MaskSpec::Threshold => MaskKind::Threshold(threshold),
            MaskSpec::Negative => MaskKind::Negative,
            MaskSpec::None => MaskKind::None,
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Params {
            fitsfile: None,
            nradii: None,
            radsep: None,
            xpos: RingValue::Auto,
            ypos: RingValue::Auto,
            vsys: RingValue::Auto,
            vrot: RingValue::Auto,
            vdisp: RingValue::Auto,
            vrad: RingValue::Value(0.0),
            inc: RingValue::Auto,
            pa: RingValue::Auto,
            z0: RingValue::Value(0.0),
            dens: RingValue::Auto,
            free: vec![FitParam::VRot, FitParam::VDisp],
            ftype: FType::AbsDiff,
            wfunc: WFunc::AbsCos,
            norm: Normalisation::Local,
            ltype: Ltype::Gaussian,
            cdens: 10.0,
            nv: -1,
            tol: 1.0e-3,
            mask: MaskSpec::Smooth,
            side: Side::Both,
            two_stage: false,
            polyn: -1,
            flag_errors: false,
            threads: 1,
            outfolder: PathBuf::from("./output"),
            threshold: 0.0,
            snr_cut: 4.0,
            growth_cut: 2.5,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

impl Params {
    pub fn from_file(path: &Path) -> Result<Params, ParamError> {
        let text = std::fs::read_to_string(path).map_err(|source| ParamError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Params::from_text(&text)
    }

    pub fn from_text(text: &str) -> Result<Params, ParamError> {
        let mut params = Params::default();
        for line in text.lines() {
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (line, ""),
            };
            params.apply(key, value)?;
        }
        Ok(params)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ParamError> {
        let bad = || ParamError::BadValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let ring_value = |v: &str| -> RingValue {
            v.parse().unwrap_or(RingValue::Auto)
        };

        match key.to_ascii_uppercase().as_str() {
            "FITSFILE" => self.fitsfile = Some(PathBuf::from(value)),
            "NRADII" => {
                self.nradii = if value.eq_ignore_ascii_case("auto") {
                    None
                } else {
                    Some(value.parse().map_err(|_| bad())?)
                }
            }
            "RADSEP" => {
                self.radsep = if value.eq_ignore_ascii_case("auto") {
                    None
                } else {
                    Some(value.parse().map_err(|_| bad())?)
                }
            }
            "XPOS" => self.xpos = ring_value(value),
            "YPOS" => self.ypos = ring_value(value),
            "VSYS" => self.vsys = ring_value(value),
            "VROT" => self.vrot = ring_value(value),
            "VDISP" => self.vdisp = ring_value(value),
            "VRAD" => self.vrad = ring_value(value),
            "INC" => self.inc = ring_value(value),
            "PA" => self.pa = ring_value(value),
            "Z0" => self.z0 = ring_value(value),
            "DENS" => self.dens = ring_value(value),
            "FREE" => {
                let mut free = Vec::new();
                for name in value.split_whitespace() {
                    free.push(FitParam::parse(name).ok_or_else(bad)?);
                }
                if free.is_empty() {
                    return Err(bad());
                }
                self.free = free;
            }
            "FTYPE" => {
                let code: i64 = value.parse().map_err(|_| bad())?;
                self.ftype = FType::from_code(code).ok_or_else(bad)?;
            }
            "WFUNC" => {
                let code: i64 = value.parse().map_err(|_| bad())?;
                self.wfunc = WFunc::from_code(code).ok_or_else(bad)?;
            }
            "NORM" => {
                self.norm = match value.to_ascii_lowercase().as_str() {
                    "local" => Normalisation::Local,
                    "azim" => Normalisation::Azimuthal,
                    "none" => Normalisation::None,
                    _ => return Err(bad()),
                }
            }
            "LTYPE" => {
                let code: i64 = value.parse().map_err(|_| bad())?;
                self.ltype = Ltype::from_code(code).ok_or_else(bad)?;
            }
            "CDENS" => self.cdens = value.parse().map_err(|_| bad())?,
            "NV" => {
                self.nv = if value.eq_ignore_ascii_case("auto") {
                    -1
                } else {
                    value.parse().map_err(|_| bad())?
                }
            }
            "TOL" => self.tol = value.parse().map_err(|_| bad())?,
            "MASK" => self.mask = MaskSpec::parse(value).ok_or_else(bad)?,
            "SIDE" => {
                self.side = match value.to_ascii_uppercase().as_str() {
                    "A" => Side::Approaching,
                    "R" => Side::Receding,
                    "B" => Side::Both,
                    _ => return Err(bad()),
                }
            }
            "TWOSTAGE" => self.two_stage = parse_bool(value).ok_or_else(bad)?,
            "POLYN" => self.polyn = value.parse().map_err(|_| bad())?,
            "FLAGERRORS" => self.flag_errors = parse_bool(value).ok_or_else(bad)?,
            "THREADS" => self.threads = value.parse().map_err(|_| bad())?,
            "OUTFOLDER" => self.outfolder = PathBuf::from(value),
            "THRESHOLD" => self.threshold = value.parse().map_err(|_| bad())?,
            "SNRCUT" => self.snr_cut = value.parse().map_err(|_| bad())?,
            "GROWTHCUT" => self.growth_cut = value.parse().map_err(|_| bad())?,
            _ => warn!(key, "unrecognised parameter, ignored"),
        }
        Ok(())
    }

    /// Serialise every recognised key. The output parses back to an equal
    /// `Params`.
    pub fn to_text(&self) -> String {
        let mut pairs: BTreeMap<&'static str, String> = BTreeMap::new();
        if let Some(f) = &self.fitsfile {
            pairs.insert("FITSFILE", f.display().to_string());
        }
        pairs.insert(
            "NRADII",
            self.nradii.map_or("auto".into(), |n| n.to_string()),
        );
        pairs.insert(
            "RADSEP",
            self.radsep.map_or("auto".into(), |r| r.to_string()),
        );
        pairs.insert("XPOS", self.xpos.to_string());
        pairs.insert("YPOS", self.ypos.to_string());
        pairs.insert("VSYS", self.vsys.to_string());
        pairs.insert("VROT", self.vrot.to_string());
        pairs.insert("VDISP", self.vdisp.to_string());
        pairs.insert("VRAD", self.vrad.to_string());
        pairs.insert("INC", self.inc.to_string());
        pairs.insert("PA", self.pa.to_string());
        pairs.insert("Z0", self.z0.to_string());
        pairs.insert("DENS", self.dens.to_string());
        pairs.insert(
            "FREE",
            self.free
                .iter()
                .map(|p| p.name())
                .collect::<Vec<_>>()
                .join(" "),
        );
        pairs.insert(
            "FTYPE",
            match self.ftype {
                FType::Chi2 => "1",
                FType::AbsDiff => "2",
                FType::FracDiff => "3",
            }
            .into(),
        );
        pairs.insert(
            "WFUNC",
            match self.wfunc {
                WFunc::Uniform => "0",
                WFunc::AbsCos => "1",
                WFunc::Cos2 => "2",
            }
            .into(),
        );
        pairs.insert(
            "NORM",
            match self.norm {
                Normalisation::Local => "local",
                Normalisation::Azimuthal => "azim",
                Normalisation::None => "none",
            }
            .into(),
        );
        pairs.insert("LTYPE", self.ltype.code().to_string());
        pairs.insert("CDENS", self.cdens.to_string());
        pairs.insert(
            "NV",
            if self.nv < 0 {
                "auto".into()
            } else {
                self.nv.to_string()
            },
        );
        pairs.insert("TOL", self.tol.to_string());
        pairs.insert("MASK", self.mask.keyword().into());
        pairs.insert(
            "SIDE",
            match self.side {
                Side::Approaching => "A",
                Side::Receding => "R",
                Side::Both => "B",
            }
            .into(),
        );
        pairs.insert("TWOSTAGE", self.two_stage.to_string());
        pairs.insert("POLYN", self.polyn.to_string());
        pairs.insert("FLAGERRORS", self.flag_errors.to_string());
        pairs.insert("THREADS", self.threads.to_string());
        pairs.insert("OUTFOLDER", self.outfolder.display().to_string());
        pairs.insert("THRESHOLD", self.threshold.to_string());
        pairs.insert("SNRCUT", self.snr_cut.to_string());
        pairs.insert("GROWTHCUT", self.growth_cut.to_string());

        let mut out = String::from("# diskfit parameter file\n");
        for (key, value) in pairs {
            out.push_str(&format!("{key:<12}{value}\n"));
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<(), ParamError> {
        std::fs::write(path, self.to_text()).map_err(|source| ParamError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip() {
        let p = Params::default();
        let q = Params::from_text(&p.to_text()).unwrap();
        assert_eq!(p, q);
    }

    #[test]
    fn full_file_round_trips() {
        let text = "\
# test galaxy
FITSFILE   ngc1234.fits
NRADII     12
RADSEP     15.5
XPOS       64.5
YPOS       63
VSYS       1042.7
VROT       auto
VDISP      profile.txt
INC        62
PA         305.5
FREE       VROT VDISP INC PA
FTYPE      1
WFUNC      2
NORM       azim
LTYPE      2
CDENS      5
NV         12
TOL        1e-4
MASK       search
SIDE       R
TWOSTAGE   true
POLYN      2
FLAGERRORS true
THREADS    4
OUTFOLDER  ./run7
SNRCUT     5
GROWTHCUT  3
";
        let p = Params::from_text(text).unwrap();
        assert_eq!(p.nradii, Some(12));
        assert_eq!(p.radsep, Some(15.5));
        assert_eq!(p.xpos, RingValue::Value(64.5));
        assert_eq!(p.vrot, RingValue::Auto);
        assert_eq!(p.vdisp, RingValue::File(PathBuf::from("profile.txt")));
        assert_eq!(p.free.len(), 4);
        assert_eq!(p.ftype, FType::Chi2);
        assert_eq!(p.wfunc, WFunc::Cos2);
        assert_eq!(p.norm, Normalisation::Azimuthal);
        assert_eq!(p.ltype, Ltype::Sech2);
        assert_eq!(p.side, Side::Receding);
        assert!(p.two_stage);
        assert_eq!(p.threads, 4);

        let q = Params::from_text(&p.to_text()).unwrap();
        assert_eq!(p, q);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let p = Params::from_text("# all defaults\n\n   \nCDENS 3 # inline comment\n").unwrap();
        assert_eq!(p.cdens, 3.0);
    }

    #[test]
    fn bad_values_are_reported() {
        assert!(matches!(
            Params::from_text("FTYPE 9"),
            Err(ParamError::BadValue { .. })
        ));
        assert!(matches!(
            Params::from_text("FREE VROT BOGUS"),
            Err(ParamError::BadValue { .. })
        ));
        assert!(matches!(
            Params::from_text("TWOSTAGE maybe"),
            Err(ParamError::BadValue { .. })
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let p = Params::from_text("NOSUCHKEY 42\nCDENS 7\n").unwrap();
        assert_eq!(p.cdens, 7.0);
    }
}
