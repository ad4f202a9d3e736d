use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use diskfit::Params;
use shared::cancel::CancelToken;

/// Derive rotation curves of disk galaxies from spectroscopic data cubes
/// with a tilted-ring model.
#[derive(Parser, Debug)]
#[command(name = "diskfit", version, about)]
struct Args {
    /// Parameter file describing the run.
    param_file: Option<PathBuf>,

    /// Run fully automatically on a FITS cube, with every parameter
    /// estimated from the data.
    #[arg(short = 'f', long = "fitsfile", conflicts_with = "param_file")]
    fitsfile: Option<PathBuf>,

    /// Override the THREADS parameter.
    #[arg(long)]
    threads: Option<usize>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut params = match (&args.param_file, &args.fitsfile) {
        (Some(path), _) => match Params::from_file(path) {
            Ok(p) => p,
            Err(err) => {
                error!("{err}");
                return ExitCode::from(1);
            }
        },
        (None, Some(fitsfile)) => {
            let mut p = Params::default();
            p.fitsfile = Some(fitsfile.clone());
            p
        }
        (None, None) => {
            error!("give a parameter file or -f FITSFILE (see --help)");
            return ExitCode::from(1);
        }
    };
    if let Some(threads) = args.threads {
        params.threads = threads;
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_token.cancel()) {
        error!("cannot install interrupt handler: {err}");
    }

    match diskfit::run(&params, &cancel) {
        Ok(summary) => {
            info!(
                rings = %summary.rings_file.display(),
                not_converged = summary.not_converged,
                "run finished"
            );
            if summary.not_converged > 0 {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            error!("{err}");
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
        }
    }
}
