mod check_cmd;
mod cli;
mod create_cmd;
mod delete_cmd;
mod extract_cmd;
mod info_cmd;
mod init_cmd;
mod list_cmd;
mod session;

use anyhow::Result;
use log::error;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_log(level: log::LevelFilter) -> Result<()> {
    let local_level = level;
    fern::Dispatch::new()
        .format(move |out, message, record| {
            if local_level > log::LevelFilter::Info {
                // Add some extra info to each message in debug
                out.finish(format_args!(
                    "[{}]({})({}) {}",
                    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                    record.target(),
                    record.level(),
                    message
                ))
            } else {
                out.finish(format_args!("{}", message))
            }
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

async fn run(command: cli::CommandOpts) -> Result<()> {
    match command {
        cli::CommandOpts::Init(opts) => init_cmd::run(opts).await,
        cli::CommandOpts::Create(opts) => create_cmd::run(opts).await,
        cli::CommandOpts::Extract(opts) => extract_cmd::run(opts).await,
        cli::CommandOpts::List(opts) => list_cmd::run(opts).await,
        cli::CommandOpts::Info(opts) => info_cmd::run(opts).await,
        cli::CommandOpts::Delete(opts) => delete_cmd::run(opts).await,
        cli::CommandOpts::Check(opts) => check_cmd::run(opts).await,
    }
}

#[tokio::main]
async fn main() {
    let (command, log_opts) = match cli::parse_opts(std::env::args_os()) {
        Ok(opts) => opts,
        Err(err) => err.exit(),
    };
    if let Err(err) = init_log(log_opts.filter) {
        eprintln!("unable to initialize log: {}", err);
        std::process::exit(1);
    }
    if let Err(err) = run(command).await {
        error!("error: {:#}", err);
        std::process::exit(1);
    }
}
