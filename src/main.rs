use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use fuser::{MountOption, Session};
use log::{error, info, LevelFilter};

use shadowfs::{MountOpts, ShadowFs};

#[derive(Parser)]
#[command(
    name = "shadowfs",
    version,
    about = "FUSE daemon exporting a DAX-backed shadow tree"
)]
struct Args {
    /// Where to mount the filesystem
    mountpoint: PathBuf,

    /// Mount options, mount(8) style; may be repeated or comma-separated.
    /// Recognized: source=/shadow/path (alias shadow=), daxdev=NAME,
    /// writeback/no_writeback, flock/no_flock, pass_yaml, timeout=SECS,
    /// cache=never|auto|always, readdirplus/no_readdirplus, debug=N
    #[arg(short = 'o', value_name = "OPTIONS")]
    options: Vec<String>,

    /// Verbosity; repeat for more detail
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run in the foreground (always the case; accepted for compatibility)
    #[arg(short = 'f', long)]
    foreground: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let opts = match MountOpts::parse(&args.options) {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("shadowfs: {err}");
            return ExitCode::FAILURE;
        }
    };

    let verbosity = u32::from(args.verbose).max(opts.debug);
    let log_level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .format_timestamp_nanos()
        .filter_level(log_level)
        .init();

    info!(
        "mounting shadow tree {:?} at {:?} (timeout={}s{})",
        opts.source.as_deref().unwrap_or_else(|| Path::new("?")),
        args.mountpoint,
        opts.timeout,
        opts.daxdev
            .as_deref()
            .map(|d| format!(", daxdev={d}"))
            .unwrap_or_default(),
    );

    let fs = match ShadowFs::new(opts) {
        Ok(fs) => fs,
        Err(err) => {
            error!("cannot open shadow tree: {err}");
            return ExitCode::FAILURE;
        }
    };

    // No MountOption::RO: setattr and flock must still reach the daemon.
    let mount_opts = [
        MountOption::FSName("shadowfs".to_string()),
        MountOption::Subtype("shadowfs".to_string()),
    ];
    let mut session = match Session::new(fs, &args.mountpoint, &mount_opts) {
        Ok(session) => session,
        Err(err) => {
            error!("cannot create session at {:?}: {err}", args.mountpoint);
            return ExitCode::FAILURE;
        }
    };

    // SIGINT/SIGTERM unmount the session, which ends the request loop.
    let mut unmounter = session.unmount_callable();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = unmounter.unmount();
    }) {
        error!("cannot install signal handler: {err}");
        return ExitCode::FAILURE;
    }

    match session.run() {
        Ok(()) => {
            info!("unmounted");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("session ended with error: {err}");
            ExitCode::FAILURE
        }
    }
}
