//! skiff command-line entry point
//!
//! Public subcommands run the client side; the hidden `_serve`, `_receive`
//! and `_present` subcommands are what the client starts on the remote host.

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::tty::IsTty;
use log::{debug, warn};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use skiff::browse::BrowseSession;
use skiff::cli::{BrowseArgs, Cli, Command, GlobalOpts, RemoteCommand};
use skiff::client::{download, upload, TransferOptions, TransferSummary};
use skiff::config::Config;
use skiff::logger::{Logger, NoopLogger, TextLogger};
use skiff::pick::{format_listing, listing_json, run_picker};
use skiff::progress::{prettify_size, Reporter, TransferProgress};
use skiff::protocol::REMOTE_ERROR_PREFIX;
use skiff::serve::dispatch;
use skiff::session::{HostSpec, ProcessExecutor};

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    if let Err(e) = run(cli) {
        eprintln!("{}{:#}", REMOTE_ERROR_PREFIX, e);
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.global.verbose { "debug" } else { "warn" };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if matches!(cli.command, Command::Remote(_)) {
        // every line ends up prefixed by the client's drain
        builder.format_timestamp(None).format_target(false);
    }
    builder.init();
}

fn run(cli: Cli) -> Result<()> {
    let global = cli.global;
    match cli.command {
        Command::Remote(remote) => run_remote(&remote),
        command => {
            ctrlc::set_handler(|| {
                eprintln!("\nInterrupted. Partial files were kept; run the same command again to resume.");
                std::process::exit(130);
            })
            .context("install Ctrl-C handler")?;
            let config = Config::load()?;
            run_client(command, &global, &config)
        }
    }
}

fn run_remote(remote: &RemoteCommand) -> Result<()> {
    debug!("remote command: {:?}", remote);
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut output = BufWriter::new(stdout.lock());
    dispatch(remote, &mut input, &mut output)?;
    output.flush().context("flush output")?;
    Ok(())
}

/// Settings resolved from the config file and command-line flags
struct ClientContext {
    ssh_program: String,
    ssh_options: Vec<String>,
    opts: TransferOptions,
    progress: bool,
}

impl ClientContext {
    fn new(global: &GlobalOpts, config: &Config, uncompressed: bool) -> Self {
        let log_file = global.log_file.clone().or_else(|| config.log_file.clone());
        let logger: Arc<dyn Logger> = match log_file {
            Some(path) => match TextLogger::new(&path) {
                Ok(l) => Arc::new(l),
                Err(e) => {
                    warn!("not logging to {}: {:#}", path.display(), e);
                    Arc::new(NoopLogger)
                }
            },
            None => Arc::new(NoopLogger),
        };
        let mut ssh_options = config.ssh_options.clone();
        ssh_options.extend(global.ssh_options.iter().cloned());
        Self {
            ssh_program: global.ssh.clone().unwrap_or_else(|| config.ssh_program.clone()),
            ssh_options,
            opts: TransferOptions {
                compress: config.compress && !uncompressed,
                remote_program: global
                    .executable
                    .clone()
                    .unwrap_or_else(|| config.remote_program.clone()),
                reporter: Reporter::new(logger, TransferProgress::new(global.progress)),
            },
            progress: global.progress,
        }
    }

    fn executor(&self, host: &str) -> Result<ProcessExecutor> {
        let spec = HostSpec::parse(host).with_context(|| format!("bad host {:?}", host))?;
        Ok(ProcessExecutor::ssh(&spec, &self.ssh_program, &self.ssh_options))
    }

    fn report(&self, verb: &str, summary: &TransferSummary) {
        if self.progress {
            return;
        }
        let mut line = format!(
            "{} {} file(s), {} -> {}",
            verb,
            summary.files,
            prettify_size(summary.bytes),
            summary.destination.display()
        );
        if summary.skipped > 0 {
            line.push_str(&format!(" ({} already present)", summary.skipped));
        }
        if summary.resumed_from > 0 {
            line.push_str(&format!(
                " (resumed at {})",
                prettify_size(summary.resumed_from)
            ));
        }
        println!("{}", line);
    }
}

fn run_client(command: Command, global: &GlobalOpts, config: &Config) -> Result<()> {
    match command {
        Command::Download(args) => {
            let ctx = ClientContext::new(global, config, args.uncompressed);
            let executor = ctx.executor(&args.host)?;
            let summary = download(&executor, &args.sources, args.destination.as_deref(), &ctx.opts)
                .with_context(|| format!("download from {}", args.host))?;
            ctx.report("Downloaded", &summary);
        }
        Command::Upload(args) => {
            let ctx = ClientContext::new(global, config, args.uncompressed);
            let executor = ctx.executor(&args.host)?;
            let summary = upload(&executor, &args.source, &args.destination, &ctx.opts)
                .with_context(|| format!("upload to {}", args.host))?;
            ctx.report("Uploaded", &summary);
        }
        Command::Pick(args) => {
            let ctx = ClientContext::new(global, config, false);
            let mut browse = open_browse(&ctx, &args)?;
            let stdin = io::stdin();
            let res = run_picker(
                &mut browse,
                stdin.lock(),
                io::stdout(),
                Path::new("."),
                &ctx.opts.reporter,
            );
            browse.stop();
            res?;
        }
        Command::List(args) => {
            let ctx = ClientContext::new(global, config, false);
            let mut browse = open_browse(&ctx, &args.browse)?;
            let res = browse.list();
            browse.stop();
            let entries = res.with_context(|| format!("list {}", args.browse.location))?;
            if args.json {
                println!("{}", listing_json(&entries)?);
            } else {
                print!("{}", format_listing(&entries, io::stdout().is_tty()));
            }
        }
        Command::Remote(remote) => run_remote(&remote)?,
    }
    Ok(())
}

fn open_browse(ctx: &ClientContext, args: &BrowseArgs) -> Result<BrowseSession> {
    let executor = ctx.executor(&args.host)?;
    BrowseSession::open(Arc::new(executor), &args.location, ctx.opts.clone())
        .with_context(|| format!("browse {} on {}", args.location, args.host))
}
