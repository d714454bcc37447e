/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use sandstorm_supervisor::config::absolutize;
use sandstorm_supervisor::config::Config;
use sandstorm_supervisor::supervisor;
use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;

/// Runs a grain supervisor for the grain <GRAIN_ID>, which is an instance of
/// app <APP_NAME>. Executes <COMMAND> inside the grain sandbox.
#[derive(Parser, Debug)]
#[clap(name = "sandstorm-supervisor", version)]
struct Args {
    /// Directory containing the app package.
    /// Defaults to '/var/sandstorm/apps/<app-name>'.
    #[clap(long, value_name = "PATH")]
    pkg: Option<PathBuf>,

    /// Directory where the grain's mutable persistent data is stored.
    /// Defaults to '/var/sandstorm/grains/<grain-id>'.
    #[clap(long, value_name = "PATH")]
    var: Option<PathBuf>,

    /// Set an environment variable inside the sandbox. Note that *no*
    /// environment variables are set by default.
    #[clap(short = 'e', long = "env", value_name = "NAME=VAL")]
    env: Vec<String>,

    /// Mount procfs inside the sandbox. For security reasons this is NOT
    /// RECOMMENDED during normal use, but it may be useful for debugging.
    #[clap(long)]
    proc: bool,

    /// Don't redirect the sandbox's stdio. Useful for debugging.
    #[clap(long)]
    stdio: bool,

    /// Allow some system calls useful for debugging which are blocked in
    /// production.
    #[clap(long)]
    dev: bool,

    /// Log the compiled seccomp filter programs.
    #[clap(long = "seccomp-dump-pfc")]
    seccomp_dump_pfc: bool,

    /// Initialize a new grain. (Otherwise, runs an existing one.)
    #[clap(short = 'n', long = "new")]
    new: bool,

    app_name: String,

    grain_id: String,

    /// Command to execute inside the sandbox, with its arguments.
    #[clap(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn init_logging() {
    let default_filter = filter::Targets::new().with_default(tracing::Level::INFO);
    let log_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_filter(default_filter);
    tracing_subscriber::registry().with(log_layer).init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    if args.proc {
        tracing::warn!("--proc is dangerous. Only use it when debugging code you trust.");
    }

    let pkg_path = args
        .pkg
        .unwrap_or_else(|| PathBuf::from("/var/sandstorm/apps").join(&args.app_name));
    let var_path = args
        .var
        .unwrap_or_else(|| PathBuf::from("/var/sandstorm/grains").join(&args.grain_id));

    let config = Config {
        app_name: args.app_name,
        grain_id: args.grain_id,
        pkg_path: absolutize(&pkg_path).context("while resolving the package path")?,
        var_path: absolutize(&var_path).context("while resolving the var path")?,
        environment: args.env,
        command: args.command,
        is_new: args.new,
        mount_proc: args.proc,
        keep_stdio: args.stdio,
        devmode: args.dev,
        seccomp_dump: args.seccomp_dump_pfc,
    };

    supervisor::run(config)
}
