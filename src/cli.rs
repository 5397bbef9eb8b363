use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;

use crate::check_cmd;
use crate::create_cmd;
use crate::delete_cmd;
use crate::extract_cmd;
use crate::info_cmd;
use crate::init_cmd;
use crate::list_cmd;
use crate::PKG_NAME;
use crate::PKG_VERSION;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOpts {
    pub filter: LevelFilter,
}

#[derive(Debug, Clone)]
pub enum CommandOpts {
    Init(init_cmd::Options),
    Create(create_cmd::Options),
    Extract(extract_cmd::Options),
    List(list_cmd::Options),
    Info(info_cmd::Options),
    Delete(delete_cmd::Options),
    Check(check_cmd::Options),
}

fn repository_arg() -> Arg {
    Arg::new("REPOSITORY")
        .value_name("REPOSITORY")
        .help("Path of the repository")
        .required(true)
}

fn archive_arg() -> Arg {
    Arg::new("ARCHIVE")
        .value_name("ARCHIVE")
        .help("Name of the archive")
        .required(true)
}

pub fn parse_opts<I, T>(args: I) -> Result<(CommandOpts, LogOpts), clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let init_subcmd = Command::new("init")
        .about("Initialize an empty repository.")
        .arg(repository_arg())
        .arg(
            Arg::new("plaintext")
                .long("plaintext")
                .action(ArgAction::SetTrue)
                .help("Store objects unencrypted"),
        );
    let create_subcmd = Command::new("create")
        .about("Create an archive from the given paths.")
        .arg(repository_arg())
        .arg(archive_arg())
        .arg(
            Arg::new("PATH")
                .value_name("PATH")
                .help("Paths to archive")
                .num_args(1..)
                .required(true),
        )
        .arg(
            Arg::new("checkpoint-interval")
                .long("checkpoint-interval")
                .value_name("SECONDS")
                .help("Write a checkpoint archive every SECONDS [default: 300]"),
        )
        .arg(
            Arg::new("numeric-owner")
                .long("numeric-owner")
                .action(ArgAction::SetTrue)
                .help("Store only numeric user and group ids"),
        );
    let extract_subcmd = Command::new("extract")
        .about("Extract an archive into the destination directory.")
        .arg(repository_arg())
        .arg(archive_arg())
        .arg(
            Arg::new("PATTERN")
                .value_name("PATTERN")
                .help("Only extract items below the given paths")
                .num_args(0..),
        )
        .arg(
            Arg::new("dest")
                .long("dest")
                .value_name("DIR")
                .help("Destination directory [default: .]"),
        )
        .arg(
            Arg::new("dry-run")
                .short('n')
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Read all data but do not touch the filesystem"),
        )
        .arg(
            Arg::new("numeric-owner")
                .long("numeric-owner")
                .action(ArgAction::SetTrue)
                .help("Restore ownership from numeric ids, not names"),
        );
    let list_subcmd = Command::new("list")
        .about("List archives, or the contents of one archive.")
        .arg(repository_arg())
        .arg(
            Arg::new("ARCHIVE")
                .value_name("ARCHIVE")
                .help("Name of the archive")
                .required(false),
        );
    let info_subcmd = Command::new("info")
        .about("Show details and size statistics of an archive.")
        .arg(repository_arg())
        .arg(archive_arg());
    let delete_subcmd = Command::new("delete")
        .about("Delete an archive and prune its unique chunks.")
        .arg(repository_arg())
        .arg(archive_arg());
    let check_subcmd = Command::new("check")
        .about("Verify repository consistency, optionally repairing it.")
        .arg(repository_arg())
        .arg(
            Arg::new("repair")
                .long("repair")
                .action(ArgAction::SetTrue)
                .help("Rewrite damaged archives and delete unused objects"),
        );

    let matches = Command::new(PKG_NAME)
        .version(PKG_VERSION)
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .global(true)
                .help("Set verbosity level"),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(init_subcmd)
        .subcommand(create_subcmd)
        .subcommand(extract_subcmd)
        .subcommand(list_subcmd)
        .subcommand(info_subcmd)
        .subcommand(delete_subcmd)
        .subcommand(check_subcmd)
        .try_get_matches_from(args)?;

    let log_opts = LogOpts {
        filter: match matches.get_count("verbose") {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        },
    };
    let command = if let Some(matches) = matches.subcommand_matches("init") {
        CommandOpts::Init(init_cmd::Options {
            repository: repository_path(matches),
            plaintext: matches.get_flag("plaintext"),
        })
    } else if let Some(matches) = matches.subcommand_matches("create") {
        CommandOpts::Create(create_cmd::Options {
            repository: repository_path(matches),
            archive: archive_name(matches),
            paths: matches
                .get_many::<String>("PATH")
                .map(|values| values.map(PathBuf::from).collect())
                .unwrap_or_default(),
            checkpoint_interval: Duration::from_secs(
                matches
                    .get_one::<String>("checkpoint-interval")
                    .map(|value| value.parse::<u64>().unwrap_or(300))
                    .unwrap_or(300),
            ),
            numeric_owner: matches.get_flag("numeric-owner"),
        })
    } else if let Some(matches) = matches.subcommand_matches("extract") {
        CommandOpts::Extract(extract_cmd::Options {
            repository: repository_path(matches),
            archive: archive_name(matches),
            patterns: matches
                .get_many::<String>("PATTERN")
                .map(|values| values.cloned().collect())
                .unwrap_or_default(),
            dest: matches
                .get_one::<String>("dest")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            dry_run: matches.get_flag("dry-run"),
            numeric_owner: matches.get_flag("numeric-owner"),
        })
    } else if let Some(matches) = matches.subcommand_matches("list") {
        CommandOpts::List(list_cmd::Options {
            repository: repository_path(matches),
            archive: matches.get_one::<String>("ARCHIVE").cloned(),
        })
    } else if let Some(matches) = matches.subcommand_matches("info") {
        CommandOpts::Info(info_cmd::Options {
            repository: repository_path(matches),
            archive: archive_name(matches),
        })
    } else if let Some(matches) = matches.subcommand_matches("delete") {
        CommandOpts::Delete(delete_cmd::Options {
            repository: repository_path(matches),
            archive: archive_name(matches),
        })
    } else if let Some(matches) = matches.subcommand_matches("check") {
        CommandOpts::Check(check_cmd::Options {
            repository: repository_path(matches),
            repair: matches.get_flag("repair"),
        })
    } else {
        unreachable!("subcommand is required");
    };
    Ok((command, log_opts))
}

fn repository_path(matches: &ArgMatches) -> PathBuf {
    matches
        .get_one::<String>("REPOSITORY")
        .map(PathBuf::from)
        .expect("required arg")
}

fn archive_name(matches: &ArgMatches) -> String {
    matches
        .get_one::<String>("ARCHIVE")
        .cloned()
        .expect("required arg")
}
