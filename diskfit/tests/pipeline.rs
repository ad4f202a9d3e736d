//! End-to-end driver run: synthesise an observation, write it to FITS,
//! fit it through the full pipeline and check the persisted outputs.

use diskfit::{fits, run, Params};
use galmod::GalmodOptions;
use shared::beam::FWHM_TO_SIGMA;
use shared::cancel::CancelToken;
use shared::geometry;
use shared::header::{Beam, Header, SpectralKind, VelocityDef};
use shared::rings::{Ring, RingSet};

fn header() -> Header {
    Header {
        naxis: [20, 20, 24],
        crpix: [1.0, 1.0, 13.0],
        crval: [10.0, -25.0, 5.0e5],
        cdelt: [-2.0 / 3600.0, 2.0 / 3600.0, 1.0e4],
        pixscale: 2.0,
        spectral_kind: SpectralKind::Velocity,
        veldef: VelocityDef::Radio,
        rest_value: 0.0,
        beam: Beam {
            bmaj: 4.0,
            bmin: 4.0,
            bpa: 0.0,
        },
        flux_unit: "JY/BEAM".into(),
        blank: None,
    }
}

fn truth() -> Ring {
    Ring {
        radius: 5.0,
        width: 10.0,
        xpos: 10.0,
        ypos: 10.0,
        vsys: 500.0,
        vrot: 80.0,
        vdisp: 8.0,
        vrad: 0.0,
        inc: 60.0,
        pa: 90.0,
        z0: 0.0,
        dens: 1.0,
    }
}

#[test]
fn fits_to_rings_pipeline_recovers_the_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let cube_path = dir.path().join("galaxy.fits");
    let out_path = dir.path().join("out");

    let h = header();
    // Same synthesis settings the driver uses, so the observation is
    // exactly reproducible inside the fit loop.
    let options = GalmodOptions {
        cdens: 2.0,
        nv: -1,
        sigma_instr: geometry::channel_width_kms(&h) / FWHM_TO_SIGMA,
        smooth: true,
        seed: 1,
        parallel: false,
        ..GalmodOptions::default()
    };
    let rings = RingSet::new(vec![truth()]).unwrap();
    let obs = galmod::synthesise(&h, &rings, &options, None, None).unwrap();
    fits::write_cube(&cube_path, &obs, &h).unwrap();

    let text = format!(
        "FITSFILE {}\n\
         NRADII   1\n\
         RADSEP   10\n\
         XPOS     10\n\
         YPOS     10\n\
         VSYS     500\n\
         VROT     95\n\
         VDISP    8\n\
         INC      60\n\
         PA       90\n\
         DENS     1\n\
         CDENS    2\n\
         FREE     VROT\n\
         MASK     none\n\
         NORM     none\n\
         THREADS  2\n\
         OUTFOLDER {}\n",
        cube_path.display(),
        out_path.display()
    );
    let params = Params::from_text(&text).unwrap();

    let summary = run(&params, &CancelToken::new()).unwrap();
    assert_eq!(summary.not_converged, 0);
    assert!(summary.rings_file.exists());
    assert!(summary.model_file.exists());
    assert!(summary.residual_file.exists());

    let fitted = diskfit::ringio::read_rings(&summary.rings_file).unwrap();
    assert_eq!(fitted.len(), 1);
    assert!(
        (fitted.get(0).vrot - 80.0).abs() < 5.0,
        "vrot = {}",
        fitted.get(0).vrot
    );

    // The residual cube must be small compared to the observation.
    let (residual, _) = fits::load_cube(&summary.residual_file).unwrap();
    let obs_total: f64 = obs.iter().map(|v| v.abs()).sum();
    let res_total: f64 = residual.as_slice().iter().map(|v| v.abs()).sum();
    assert!(
        res_total < 0.1 * obs_total,
        "residual {res_total} vs observation {obs_total}"
    );
}

#[test]
fn missing_fitsfile_is_a_user_error() {
    let params = Params::default();
    let err = run(&params, &CancelToken::new()).unwrap_err();
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn unreadable_cube_maps_to_io_exit_code() {
    let mut params = Params::default();
    params.fitsfile = Some("/nonexistent/galaxy.fits".into());
    let err = run(&params, &CancelToken::new()).unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn cancellation_before_start_exits_130() {
    let dir = tempfile::tempdir().unwrap();
    let cube_path = dir.path().join("galaxy.fits");
    let h = header();
    let rings = RingSet::new(vec![truth()]).unwrap();
    let options = GalmodOptions {
        cdens: 1.0,
        smooth: false,
        parallel: false,
        seed: 1,
        ..GalmodOptions::default()
    };
    let obs = galmod::synthesise(&h, &rings, &options, None, None).unwrap();
    fits::write_cube(&cube_path, &obs, &h).unwrap();

    let mut params = Params::default();
    params.fitsfile = Some(cube_path);
    params.outfolder = dir.path().join("out");
    let token = CancelToken::new();
    token.cancel();
    let err = run(&params, &token).unwrap_err();
    assert_eq!(err.exit_code(), 130);
}
