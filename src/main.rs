//! clpipe command line: list compute devices or run the packed-index kernel.

use clap::{Parser, Subcommand};
use clpipe::driver::DeviceType;
use clpipe::kernel::Color;
use clpipe::{report, Backend, Config, Error};
use std::io::Write;
use std::process::ExitCode;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "clpipe")]
#[command(about = "Enumerate compute devices and dispatch a kernel", long_about = None)]
#[command(version)]
struct Cli {
    /// Platform implementation to use (emulated, native)
    #[arg(long, global = true, default_value = "emulated")]
    backend: Backend,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every platform and its devices
    Devices {
        /// Buffer size for device names, terminator included
        #[arg(long, default_value_t = 100)]
        name_capacity: usize,
    },

    /// Run the kernel on the first matching device and print the result grid
    Run {
        /// Device type to select (default, cpu, gpu, accelerator, all)
        #[arg(long, default_value = "gpu")]
        device_type: DeviceType,

        /// Also consider devices reporting themselves unavailable
        #[arg(long)]
        allow_unavailable: bool,

        /// Options passed to the program build
        #[arg(long, default_value = "")]
        build_options: String,

        /// Buffer size for the build log, terminator included
        #[arg(long, default_value_t = 1024)]
        log_capacity: usize,

        /// Print each cell decoded into its (i, j) indices
        #[arg(long)]
        decode: bool,

        /// Print the dispatch dimensions and the selected device first
        #[arg(long)]
        describe: bool,

        /// Also pass a color by value and print the sum of its channels (r,g,b)
        #[arg(long)]
        color: Option<Color>,
    },
}

fn setup_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let result = match cli.command {
        Commands::Devices { name_capacity } => Config::builder()
            .backend(cli.backend)
            .name_capacity(name_capacity)
            .build()
            .and_then(|config| list_devices(&mut out, &config)),
        Commands::Run {
            device_type,
            allow_unavailable,
            build_options,
            log_capacity,
            decode,
            describe,
            color,
        } => Config::builder()
            .backend(cli.backend)
            .device_type(device_type)
            .require_available(!allow_unavailable)
            .build_options(build_options)
            .build_log_capacity(log_capacity)
            .build()
            .and_then(|config| {
                let view = RunView {
                    decode,
                    describe,
                    color,
                };
                run_kernel(&mut out, &config, &view)
            }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            debug!(stage = err.stage(), "run failed");
            eprintln!("error: {}", err);
            if let Err(report_err) = report::write_build_failure(&mut out, &err) {
                eprintln!("error: {}", report_err);
            }
            let _ = out.flush();
            ExitCode::FAILURE
        }
    }
}

fn list_devices<W: Write>(out: &mut W, config: &Config) -> Result<(), Error> {
    let driver = clpipe::connect(config.backend)?;
    let directory = clpipe::enumerate(driver.as_ref(), config)?;
    report::write_directory(out, &directory)
}

/// What `run` prints besides the grid.
struct RunView {
    decode: bool,
    describe: bool,
    color: Option<Color>,
}

fn run_kernel<W: Write>(out: &mut W, config: &Config, view: &RunView) -> Result<(), Error> {
    let driver = clpipe::connect(config.backend)?;
    let directory = clpipe::enumerate(driver.as_ref(), config)?;
    let device = directory.select(config)?;
    debug!(
        name = %device.name,
        platform = device.platform,
        index = device.index,
        "device selected"
    );
    if view.describe {
        report::write_setup(out, &config.global, device)?;
    }

    let grid = match view.color {
        Some(color) => {
            let result = clpipe::run_color_sum(driver.as_ref(), device.id, config, color)?;
            report::write_grid(out, &result.grid)?;
            report::write_color_sum(out, result.sum)?;
            result.grid
        }
        None => {
            let grid = clpipe::run(driver.as_ref(), device.id, config)?;
            report::write_grid(out, &grid)?;
            grid
        }
    };
    if view.decode {
        report::write_decoded(out, &grid)?;
    }
    Ok(())
}
