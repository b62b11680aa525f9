#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::correctness,
    missing_debug_implementations,
    missing_docs,
    clippy::all,
    clippy::wildcard_imports,
    clippy::needless_borrow,
    clippy::cast_lossless,
    clippy::unused_async,
    clippy::explicit_iter_loop,
    clippy::explicit_into_iter_loop,
    clippy::cloned_instead_of_copied
)]
#![cfg_attr(not(test), forbid(clippy::indexing_slicing))]
#![cfg_attr(not(test), forbid(clippy::string_slice))]
#![allow(
    clippy::match_bool,
    clippy::mixed_read_write_in_expression,
    clippy::bool_assert_comparison,
    clippy::manual_split_once,
    clippy::format_push_string,
    clippy::bool_to_int_with_if
)]
mod boundary;
mod config;
pub(crate) mod error;
pub(crate) mod handshake;
pub(crate) mod relay;
pub(crate) mod routing;
pub(crate) mod sink;
pub(crate) mod smtp_client;
pub(crate) mod smtp_server;
pub(crate) mod swift;
pub(crate) mod utils;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use config::{Config, TEMPLATE};
use env_logger::Env;
use error::Error;
use routing::Resolution;
use sink::{SwiftSink, Uploader};
use smtp_server::{Proxy, run_smtp_server};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Stores mail for selected recipients in OpenStack Swift.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The configuration file
    #[arg(long, value_name = "FILE", default_value = "/etc/swiftdrop.ini")]
    config: PathBuf,

    /// The input file, `-` for stdin
    #[arg(long, value_name = "FILE", default_value = "-")]
    input: PathBuf,

    /// Check that the destinations of the recipients are reachable
    #[arg(long)]
    test_connect: bool,

    /// Run as SMTP proxy in front of the local MTA
    #[arg(long)]
    run_as_proxy: bool,

    /// Recipient addresses of the message
    recipients: Vec<String>,
}

#[tokio::main]
async fn main() {
    // default to info level
    let env = Env::new().filter_or("RUST_LOG", "info");
    env_logger::Builder::from_env(env)
        // disable timestamps - automatically added by systemd
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    if !args.config.exists() {
        if let Err(e) = std::fs::write(&args.config, TEMPLATE) {
            eprintln!("Failed to write {}: {e}", args.config.display());
            process::exit(1);
        }
        eprintln!("default config options written to {}", args.config.display());
        process::exit(1);
    }

    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to read config: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(args, config).await {
        eprintln!("mail transport unavailable: {e}");
        process::exit(1);
    }
}

fn usage_error(message: &str) -> ! {
    Args::command()
        .error(ErrorKind::MissingRequiredArgument, message)
        .exit()
}

async fn run(args: Args, config: Config) -> Result<(), Error> {
    let params = config.params;
    let routing = Arc::new(config.routing);
    let uploader = Uploader::new(routing.clone(), SwiftSink);

    if args.run_as_proxy && !args.test_connect {
        let proxy = Arc::new(Proxy {
            mta_addr: params.mta_addr(),
            relay: params.relay_config(),
            routing,
            uploader,
        });
        return run_smtp_server(params.listen_addr(), proxy).await;
    }

    if args.recipients.is_empty() {
        usage_error("missing recipients");
    }

    let recipients: Vec<String> = args.recipients.iter().map(|r| r.to_lowercase()).collect();

    if args.test_connect {
        return uploader.test_connect(&recipients).await;
    }

    let message = read_input(&args.input).await?;
    uploader
        .upload(&recipients, &message, Resolution::WithDefault)
        .await?;
    Ok(())
}

/// Reads the whole message from `path`, or from stdin for `-`.
async fn read_input(path: &Path) -> Result<Vec<u8>, Error> {
    if path != Path::new("-") {
        return Ok(tokio::fs::read(path).await?);
    }

    if std::io::stdin().is_terminal() {
        usage_error("missing input on stdin");
    }
    let mut message = Vec::new();
    tokio::io::stdin().read_to_end(&mut message).await?;
    Ok(message)
}
