use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::error;
use pixie_smplx::{convert, default_output_path, InspectionReport, PoseRecord, RootFixConfig};
use std::{error::Error, path::PathBuf, process::ExitCode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Only print what the file contains
    Inspect,
    /// Only convert and save
    Convert,
    /// Print the contents, then convert
    Both,
}

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "Binary that converts a PIXIE pose pickle into SMPL-X parameters. The output name gets a _rootX180 / _nofix (and _Z180) tag before the extension."
)]
struct Args {
    /// Input file. A pickle written by PIXIE.
    #[arg(short, long)]
    input: PathBuf,
    /// Output file. Defaults to <input stem>_smplx.pkl next to the input.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Do not turn the root 180 degrees about X
    #[arg(long)]
    no_root_x: bool,
    /// Also turn the root 180 degrees about Z, after the X turn
    #[arg(long)]
    root_z: bool,
    #[arg(short, long, value_enum, default_value_t = Mode::Both)]
    mode: Mode,
    /// Print the inspection report as JSON
    #[arg(long)]
    json: bool,
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let record = PoseRecord::from_file(&args.input)?;
    if args.mode != Mode::Convert {
        let report = InspectionReport::new(&record).with_source(&args.input);
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("{report}");
        }
    }
    if args.mode == Mode::Inspect {
        return Ok(());
    }
    let config = RootFixConfig::new(!args.no_root_x, args.root_z);
    let params = convert(&record, &config)?;
    let requested = args.output.clone().unwrap_or_else(|| default_output_path(&args.input));
    let written = params.save(&requested, &config)?;
    println!("{}", written.display());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
