use std::path::{Path, PathBuf};
use std::process::exit;

use clap::{crate_version, value_parser, Arg, ArgAction, ArgGroup, Command};
use log::LevelFilter;

use vmdk_extract::driver;
use vmdk_extract::error::DiskError;
use vmdk_extract::ntfs::NtfsError;

fn build_command() -> Command {
    Command::new("vmdk-extract")
        .version(crate_version!())
        .about("List and extract NTFS files from VMware VMDK disk images.")
        .arg(
            Arg::new("vmdk")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("Path to the VMDK descriptor file"),
        )
        .arg(
            Arg::new("snapshot")
                .long("snapshot")
                .action(ArgAction::SetTrue)
                .help("Write the directory listing of every NTFS partition: --snapshot [outfile]"),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .action(ArgAction::SetTrue)
                .help("Extract one file: --dump [partition# [path [outfile]]]"),
        )
        .group(
            ArgGroup::new("verb")
                .args(["snapshot", "dump"])
                .required(true),
        )
        .arg(
            Arg::new("args")
                .num_args(0..=3)
                .value_name("ARGS")
                .help("Arguments of the chosen verb"),
        )
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("warn")
                .help("Set the log verbosity level"),
        )
}

fn run() -> anyhow::Result<()> {
    let matches = match build_command().try_get_matches() {
        Ok(matches) => matches,
        Err(e) if e.use_stderr() => {
            // usage problems exit with 1, unlike clap's default of 2
            let _ = e.print();
            exit(1);
        }
        Err(e) => {
            // --help and --version
            let _ = e.print();
            exit(0);
        }
    };

    let level = match matches.get_one::<String>("log_level").unwrap().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    let vmdk = matches.get_one::<PathBuf>("vmdk").unwrap();
    let args: Vec<&String> = matches
        .get_many::<String>("args")
        .map(Iterator::collect)
        .unwrap_or_default();

    if matches.get_flag("snapshot") {
        let out = args.first().map(|s| Path::new(s.as_str()));
        driver::snapshot(vmdk, out)
    } else {
        let partition = match args.first() {
            Some(word) => word.parse::<usize>()?,
            None => 0,
        };
        let inner_path = args
            .get(1)
            .map(|s| s.as_str())
            .unwrap_or(driver::DEFAULT_DUMP_PATH);
        let out = args
            .get(2)
            .map(|s| Path::new(s.as_str()))
            .unwrap_or(Path::new(driver::DEFAULT_DUMP_OUT));
        driver::dump(vmdk, partition, inner_path, out)
    }
}

/// 0 = success, 1 = usage, 2 = rejected input, 3 = runtime failure,
/// 7 = anything else.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<std::num::ParseIntError>().is_some() {
        return 1;
    }
    if let Some(disk_err) = err.downcast_ref::<DiskError>() {
        return match disk_err {
            DiskError::InvalidDescriptor(_)
            | DiskError::InvalidPartitionTable(_)
            | DiskError::UnsupportedExtent(_) => 2,
            _ => 3,
        };
    }
    if let Some(ntfs_err) = err.downcast_ref::<NtfsError>() {
        return match ntfs_err {
            NtfsError::Parse(_) | NtfsError::Unsupported(_) | NtfsError::NotFound(_) => 2,
            NtfsError::Io(_) | NtfsError::Disk(_) | NtfsError::InvalidData(_) => 3,
        };
    }
    7
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        exit(exit_code_for(&err));
    }
}
