//! Thin FITS I/O for primary-HDU image cubes.
//!
//! Reads 2D/3D primary HDUs of the common integer and floating-point
//! BITPIX kinds into the in-memory cube, mapping the header keywords the
//! pipeline consumes (grid, spectral axis, beam, units, blanking) onto
//! [`Header`]. Writing stores the model as 32-bit floats with the same
//! grid keywords.

use std::path::{Path, PathBuf};

use fitrs::{Fits, FitsData, Hdu, HeaderValue};
use thiserror::Error;

use ndarray::Array3;
use shared::cube::{Cube, CubeError};
use shared::header::{Beam, Header, SpectralKind, VelocityDef};

#[derive(Error, Debug)]
pub enum FitsError {
    #[error("cannot open {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path}: no primary HDU")]
    NoPrimaryHdu { path: PathBuf },
    #[error("{path}: missing required keyword {key}")]
    MissingKeyword { path: PathBuf, key: &'static str },
    #[error("{path}: only 2- or 3-dimensional images are supported (NAXIS={naxis})")]
    BadDimensions { path: PathBuf, naxis: usize },
    #[error("{path}: unsupported data type in primary HDU")]
    UnsupportedData { path: PathBuf },
    #[error("{path}: {source}")]
    Shape {
        path: PathBuf,
        source: CubeError,
    },
}

fn value_f64(hdu: &Hdu, key: &str) -> Option<f64> {
    match hdu.value(key)? {
        HeaderValue::RealFloatingNumber(v) => Some(*v),
        HeaderValue::IntegerNumber(v) => Some(*v as f64),
        _ => None,
    }
}

fn value_string(hdu: &Hdu, key: &str) -> Option<String> {
    match hdu.value(key)? {
        HeaderValue::CharacterString(s) => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Unit scale factor to SI for a spectral axis unit string.
fn unit_scale(unit: &str) -> f64 {
    match unit.to_ascii_uppercase().as_str() {
        "KM/S" | "KM S-1" => 1.0e3,
        "KHZ" => 1.0e3,
        "MHZ" => 1.0e6,
        "GHZ" => 1.0e9,
        "MM" => 1.0e-3,
        "UM" | "MICRON" => 1.0e-6,
        "NM" => 1.0e-9,
        "ANGSTROM" | "A" => 1.0e-10,
        _ => 1.0,
    }
}

fn spectral_kind(ctype: &str) -> SpectralKind {
    let t = ctype.to_ascii_uppercase();
    if t.starts_with("FREQ") {
        SpectralKind::Frequency
    } else if t.starts_with("WAVE") || t.starts_with("AWAV") || t.starts_with("LAMBDA") {
        SpectralKind::Wavelength
    } else {
        SpectralKind::Velocity
    }
}

fn velocity_def(ctype: &str, velref: Option<f64>) -> VelocityDef {
    let t = ctype.to_ascii_uppercase();
    if t.starts_with("VOPT") || t.starts_with("FELO") {
        return VelocityDef::Optical;
    }
    if t.starts_with("VRAD") {
        return VelocityDef::Radio;
    }
    // VELREF: 1/257 LSR, optical below 256, radio above.
    match velref {
        Some(v) if v < 256.0 => VelocityDef::Optical,
        _ => VelocityDef::Radio,
    }
}

/// Load a cube and its grid description from the primary HDU.
pub fn load_cube(path: &Path) -> Result<(Cube, Header), FitsError> {
    let not_found = |source: std::io::Error| FitsError::Io {
        path: path.to_path_buf(),
        source,
    };
    let fits = Fits::open(path).map_err(not_found)?;
    let hdu = fits.get(0).ok_or_else(|| FitsError::NoPrimaryHdu {
        path: path.to_path_buf(),
    })?;

    let require = |key: &'static str| -> Result<f64, FitsError> {
        value_f64(&hdu, key).ok_or(FitsError::MissingKeyword {
            path: path.to_path_buf(),
            key,
        })
    };

    let naxis = require("NAXIS")? as usize;
    if !(2..=3).contains(&naxis) {
        return Err(FitsError::BadDimensions {
            path: path.to_path_buf(),
            naxis,
        });
    }
    let nx = require("NAXIS1")? as usize;
    let ny = require("NAXIS2")? as usize;
    let nz = if naxis == 3 {
        require("NAXIS3")? as usize
    } else {
        1
    };

    let axis = |key: &str, n: usize, default: f64| -> f64 {
        value_f64(&hdu, &format!("{key}{n}")).unwrap_or(default)
    };
    let crpix = [axis("CRPIX", 1, 1.0), axis("CRPIX", 2, 1.0), axis("CRPIX", 3, 1.0)];
    let mut crval = [axis("CRVAL", 1, 0.0), axis("CRVAL", 2, 0.0), axis("CRVAL", 3, 0.0)];
    let mut cdelt = [axis("CDELT", 1, 1.0), axis("CDELT", 2, 1.0), axis("CDELT", 3, 1.0)];

    // Spatial pixel scale in arcsec; CUNIT1 defaults to degrees.
    let cunit1 = value_string(&hdu, "CUNIT1").unwrap_or_else(|| "DEG".into());
    let pixscale = match cunit1.to_ascii_uppercase().as_str() {
        "ARCSEC" => cdelt[0].abs(),
        "ARCMIN" => cdelt[0].abs() * 60.0,
        _ => cdelt[0].abs() * 3600.0,
    };

    let ctype3 = value_string(&hdu, "CTYPE3").unwrap_or_else(|| "VELO".into());
    let kind = spectral_kind(&ctype3);
    let veldef = velocity_def(&ctype3, value_f64(&hdu, "VELREF"));

    // Normalise the spectral axis to SI units.
    let cunit3 = value_string(&hdu, "CUNIT3").unwrap_or_default();
    let scale3 = if cunit3.is_empty() {
        1.0
    } else {
        unit_scale(&cunit3)
    };
    crval[2] *= scale3;
    cdelt[2] *= scale3;

    let rest_value = match kind {
        SpectralKind::Frequency => value_f64(&hdu, "RESTFRQ")
            .or_else(|| value_f64(&hdu, "RESTFREQ"))
            .unwrap_or(0.0),
        SpectralKind::Wavelength => value_f64(&hdu, "RESTWAV").unwrap_or(0.0),
        SpectralKind::Velocity => 0.0,
    };

    let beam = match (value_f64(&hdu, "BMAJ"), value_f64(&hdu, "BMIN")) {
        (Some(bmaj), Some(bmin)) => Beam {
            bmaj: bmaj * 3600.0,
            bmin: bmin * 3600.0,
            bpa: value_f64(&hdu, "BPA").unwrap_or(0.0),
        },
        _ => Beam::unknown(),
    };

    let blank = value_f64(&hdu, "BLANK");
    let flux_unit = value_string(&hdu, "BUNIT").unwrap_or_default();

    let header = Header {
        naxis: [nx, ny, nz],
        crpix,
        crval,
        cdelt,
        pixscale,
        spectral_kind: kind,
        veldef,
        rest_value,
        beam,
        flux_unit,
        blank,
    };

    let flat: Vec<f64> = match hdu.read_data() {
        FitsData::FloatingPoint32(arr) => arr.data.iter().map(|&v| v as f64).collect(),
        FitsData::FloatingPoint64(arr) => arr.data.clone(),
        FitsData::IntegersI32(arr) => arr
            .data
            .iter()
            .map(|v| match v {
                Some(i) => *i as f64,
                None => f64::NAN,
            })
            .collect(),
        FitsData::IntegersU32(arr) => arr
            .data
            .iter()
            .map(|v| match v {
                Some(i) => *i as f64,
                None => f64::NAN,
            })
            .collect(),
        FitsData::Characters(_) => {
            return Err(FitsError::UnsupportedData {
                path: path.to_path_buf(),
            })
        }
    };

    // Map the blanking value (integer data) onto NaN.
    let flat: Vec<f64> = match blank {
        Some(b) => flat
            .into_iter()
            .map(|v| if v == b { f64::NAN } else { v })
            .collect(),
        None => flat,
    };

    let cube = Cube::from_fits_order(nx, ny, nz, &flat).map_err(|source| FitsError::Shape {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((cube, header))
}

/// Write a cube as 32-bit floats in the primary HDU, carrying the grid
/// keywords of `header`.
pub fn write_cube(path: &Path, data: &Array3<f64>, header: &Header) -> Result<(), FitsError> {
    let (nx, ny, nz) = data.dim();
    let mut flat = vec![0.0f32; nx * ny * nz];
    for ((x, y, z), &v) in data.indexed_iter() {
        flat[x + y * nx + z * nx * ny] = v as f32;
    }

    let mut hdu = Hdu::new(&[nx, ny, nz], flat);
    let real = HeaderValue::RealFloatingNumber;
    for i in 0..3 {
        hdu.insert(format!("CRPIX{}", i + 1).as_str(), real(header.crpix[i]));
        hdu.insert(format!("CRVAL{}", i + 1).as_str(), real(header.crval[i]));
        hdu.insert(format!("CDELT{}", i + 1).as_str(), real(header.cdelt[i]));
    }
    match header.spectral_kind {
        SpectralKind::Frequency => {
            hdu.insert("CTYPE3", HeaderValue::CharacterString("FREQ".into()));
            hdu.insert("RESTFRQ", real(header.rest_value));
        }
        SpectralKind::Wavelength => {
            hdu.insert("CTYPE3", HeaderValue::CharacterString("WAVE".into()));
            hdu.insert("RESTWAV", real(header.rest_value));
        }
        SpectralKind::Velocity => {
            hdu.insert("CTYPE3", HeaderValue::CharacterString("VELO".into()));
        }
    }
    if header.beam.is_known() {
        hdu.insert("BMAJ", real(header.beam.bmaj / 3600.0));
        hdu.insert("BMIN", real(header.beam.bmin / 3600.0));
        hdu.insert("BPA", real(header.beam.bpa));
    }
    if !header.flux_unit.is_empty() {
        hdu.insert(
            "BUNIT",
            HeaderValue::CharacterString(header.flux_unit.clone()),
        );
    }

    Fits::create(path, hdu).map_err(|source| FitsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::header::{SpectralKind, VelocityDef};

    fn header() -> Header {
        Header {
            naxis: [6, 5, 4],
            crpix: [1.0, 1.0, 2.0],
            crval: [10.0, -30.0, 1.4e9],
            cdelt: [-1.5 / 3600.0, 1.5 / 3600.0, -4.0e4],
            pixscale: 1.5,
            spectral_kind: SpectralKind::Frequency,
            veldef: VelocityDef::Radio,
            rest_value: 1.420405751786e9,
            beam: Beam {
                bmaj: 12.0,
                bmin: 9.0,
                bpa: 33.0,
            },
            flux_unit: "JY/BEAM".into(),
            blank: None,
        }
    }

    #[test]
    fn cube_round_trips_through_fits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.fits");
        let h = header();
        let mut data = Array3::<f64>::zeros((6, 5, 4));
        for ((x, y, z), v) in data.indexed_iter_mut() {
            *v = (x + 10 * y + 100 * z) as f64;
        }
        write_cube(&path, &data, &h).unwrap();

        let (cube, read) = load_cube(&path).unwrap();
        assert_eq!(cube.dims(), (6, 5, 4));
        assert_eq!(read.naxis, h.naxis);
        assert_eq!(read.spectral_kind, SpectralKind::Frequency);
        assert!((read.pixscale - 1.5).abs() < 1e-9);
        assert!((read.beam.bmaj - 12.0).abs() < 1e-6);
        assert!((read.rest_value - h.rest_value).abs() < 1.0);
        for ((x, y, z), &v) in data.indexed_iter() {
            assert_eq!(cube.get(x, y, z), v);
        }
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            load_cube(Path::new("/nonexistent/cube.fits")),
            Err(FitsError::Io { .. })
        ));
    }
}
