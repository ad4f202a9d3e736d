//! Whitespace-delimited ring tables.
//!
//! One row per ring, `#` comments. Columns: index, radius, vrot, vdisp,
//! inc, pa, z0, xpos, ypos, vsys, vrad, density. Uncertainties (when
//! requested) go to a parallel file with the same schema and an `err`
//! suffix per column; parameters that were not free carry zeros there.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use shared::rings::{FitParam, Ring, RingError, RingSet};

#[derive(Error, Debug)]
pub enum RingIoError {
    #[error("cannot access ring file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path}:{line}: expected {expected} numeric columns, got {got}")]
    BadRow {
        path: PathBuf,
        line: usize,
        expected: usize,
        got: usize,
    },
    #[error("{path}:{line}: unparseable number '{token}'")]
    BadNumber {
        path: PathBuf,
        line: usize,
        token: String,
    },
    #[error("ring table is invalid: {0}")]
    Rings(#[from] RingError),
}

const COLUMNS: usize = 12;

const HEADER: &str = "#  ring   radius     vrot    vdisp      inc       pa       z0     xpos     ypos     vsys     vrad       dens\n";

const ERR_HEADER: &str = "#  ring   radius  vroterr vdisperr   incerr    paerr    z0err  xposerr  yposerr  vsyserr  vraderr       dens\n";

/// Read a ring table.
pub fn read_rings(path: &Path) -> Result<RingSet, RingIoError> {
    let text = std::fs::read_to_string(path).map_err(|source| RingIoError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut rings = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = match raw.find('#') {
            Some(i) => &raw[..i],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != COLUMNS {
            return Err(RingIoError::BadRow {
                path: path.to_path_buf(),
                line: lineno + 1,
                expected: COLUMNS,
                got: tokens.len(),
            });
        }
        let mut values = [0.0f64; COLUMNS];
        for (i, token) in tokens.iter().enumerate() {
            values[i] = token.parse().map_err(|_| RingIoError::BadNumber {
                path: path.to_path_buf(),
                line: lineno + 1,
                token: token.to_string(),
            })?;
        }
        // Ring widths are implied by the radial sampling; recovered below.
        rings.push(Ring {
            radius: values[1],
            width: 0.0,
            vrot: values[2],
            vdisp: values[3],
            inc: values[4],
            pa: values[5],
            z0: values[6],
            xpos: values[7],
            ypos: values[8],
            vsys: values[9],
            vrad: values[10],
            dens: values[11],
        });
    }

    // Common radial separation from the first pair (or twice the first
    // radius for a single ring).
    let width = match rings.len() {
        0 => 0.0,
        1 => 2.0 * rings[0].radius,
        _ => rings[1].radius - rings[0].radius,
    };
    for ring in rings.iter_mut() {
        ring.width = width;
    }
    Ok(RingSet::new(rings)?)
}

fn format_row(index: usize, r: &Ring) -> String {
    format!(
        "{:>7} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>10.3e}\n",
        index, r.radius, r.vrot, r.vdisp, r.inc, r.pa, r.z0, r.xpos, r.ypos, r.vsys, r.vrad, r.dens
    )
}

/// Write a ring table.
pub fn write_rings(path: &Path, rings: &RingSet) -> Result<(), RingIoError> {
    let as_io = |source: std::io::Error| RingIoError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::create(path).map_err(as_io)?;
    file.write_all(HEADER.as_bytes()).map_err(as_io)?;
    for (i, ring) in rings.iter().enumerate() {
        file.write_all(format_row(i + 1, ring).as_bytes()).map_err(as_io)?;
    }
    Ok(())
}

/// Write the parallel uncertainty table: same schema, parameter columns
/// hold the per-ring errors of the free parameters and zeros elsewhere.
pub fn write_ring_errors(
    path: &Path,
    rings: &RingSet,
    free: &[FitParam],
    errors: &[Vec<f64>],
) -> Result<(), RingIoError> {
    let as_io = |source: std::io::Error| RingIoError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::create(path).map_err(as_io)?;
    file.write_all(ERR_HEADER.as_bytes()).map_err(as_io)?;

    for (i, ring) in rings.iter().enumerate() {
        let mut err_ring = Ring {
            vrot: 0.0,
            vdisp: 0.0,
            vrad: 0.0,
            inc: 0.0,
            pa: 0.0,
            z0: 0.0,
            xpos: 0.0,
            ypos: 0.0,
            vsys: 0.0,
            dens: 0.0,
            ..*ring
        };
        if let Some(ring_errors) = errors.get(i) {
            for (param, &err) in free.iter().zip(ring_errors.iter()) {
                param.set(&mut err_ring, err);
            }
        }
        file.write_all(format_row(i + 1, &err_ring).as_bytes())
            .map_err(as_io)?;
    }
    Ok(())
}

/// Read a one-column profile file (one value per ring).
pub fn read_profile(path: &Path) -> Result<Vec<f64>, RingIoError> {
    let text = std::fs::read_to_string(path).map_err(|source| RingIoError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut values = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = match raw.find('#') {
            Some(i) => &raw[..i],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        // Accept either a bare value or a (radius, value) pair; the last
        // token is the value.
        let token = line
            .split_whitespace()
            .last()
            .expect("non-empty line has a token");
        values.push(token.parse().map_err(|_| RingIoError::BadNumber {
            path: path.to_path_buf(),
            line: lineno + 1,
            token: token.to_string(),
        })?);
    }
    Ok(values)
}
