use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;
use vm_profile_cache::{
    config::VmFlags, reader::validate_header, report, ProfileCacheConfig, ProfileLogReader,
};

fn file_arg() -> Arg {
    Arg::new("file")
        .value_name("FILE")
        .help("Profile log file")
        .required(true)
}

fn app_id_arg() -> Arg {
    Arg::new("app-id")
        .short('a')
        .long("app-id")
        .value_name("ID")
        .help("Expected application id (0 accepts any)")
        .value_parser(clap::value_parser!(u32))
        .required(false)
}

fn app_id(matches: &ArgMatches) -> u32 {
    matches.get_one::<u32>("app-id").copied().unwrap_or(0)
}

fn file(matches: &ArgMatches) -> anyhow::Result<PathBuf> {
    matches
        .get_one::<String>("file")
        .map(PathBuf::from)
        .context("missing profile log path")
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = Command::new("vm-profile-cache")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inspect JIT profile cache logs")
        .subcommand_required(true)
        .subcommand(
            Command::new("dump")
                .about("Print header, class table and method records")
                .arg(file_arg())
                .arg(app_id_arg()),
        )
        .subcommand(
            Command::new("verify")
                .about("Validate the header and report why a log would be rejected")
                .arg(file_arg())
                .arg(app_id_arg()),
        )
        .subcommand(
            Command::new("check-config")
                .about("Validate a profile cache TOML configuration")
                .arg(
                    Arg::new("file")
                        .value_name("FILE")
                        .help("Configuration file")
                        .required(true),
                )
                .arg(
                    Arg::new("interpreter-only")
                        .long("interpreter-only")
                        .help("Validate as if the VM runs interpreter only")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("class-unloading")
                        .long("class-unloading")
                        .help("Validate as if class unloading is enabled")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("dump", sub)) => {
            let path = file(sub)?;
            let profile = ProfileLogReader::parse_file(&path, app_id(sub))
                .with_context(|| format!("failed to parse {}", path.display()))?;
            print!("{}", report::format_profile(&profile));
        }
        Some(("verify", sub)) => {
            let path = file(sub)?;
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            match validate_header(&bytes, app_id(sub)) {
                Ok(header) => {
                    print!("{}", report::format_header(&header));
                    println!("OK: {} is a valid profile log", path.display());
                }
                Err(e) => {
                    println!("REJECTED: {}: {}", path.display(), e);
                    std::process::exit(1);
                }
            }
        }
        Some(("check-config", sub)) => {
            let path = file(sub)?;
            let config = ProfileCacheConfig::from_file(&path)?;
            let flags = VmFlags {
                interpreter_only: sub.get_flag("interpreter-only"),
                class_unloading: sub.get_flag("class-unloading"),
            };
            config.validate(&flags)?;
            println!(
                "OK: mode {:?}, profile {}",
                config.effective_mode(),
                config.profile_path.display()
            );
        }
        _ => anyhow::bail!("no subcommand given"),
    }
    Ok(())
}
