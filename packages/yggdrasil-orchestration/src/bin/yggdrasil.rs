//! Yggdrasil CLI
//!
//! # Usage
//!
//! ```bash
//! # Watch CouchDB and trigger directories until Ctrl-C / SIGTERM
//! yggdrasil daemon
//!
//! # Process one project document and exit with its outcome
//! yggdrasil run-doc <doc_id> [--manual-submit]
//!
//! # Debug logging and config.dev.json overrides
//! yggdrasil --dev --config /etc/ygg/config.json daemon
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use yggdrasil_orchestration::config::{SessionFlags, YggdrasilConfig};
use yggdrasil_orchestration::daemon::{bootstrap, run_doc, Daemon};
use yggdrasil_orchestration::logging::{init_logging, LogSettings};

#[derive(Parser)]
#[command(name = "yggdrasil")]
#[command(version, about = "Yggdrasil - orchestration daemon for sequencing projects", long_about = None)]
struct Cli {
    /// Debug logging and `<config>.dev.json` overrides
    #[arg(long, global = true)]
    dev: bool,

    /// Config file (default: $YGG_CONFIG or config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for work and process it until interrupted
    Daemon,

    /// Process a single project document
    RunDoc {
        /// Project document id
        doc_id: String,

        /// Wait for an operator-submitted job instead of submitting
        #[arg(short, long)]
        manual_submit: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("yggdrasil: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let path = YggdrasilConfig::resolve_path(cli.config.as_deref());
    let config = YggdrasilConfig::load(&path, cli.dev)
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    init_logging(&LogSettings {
        dev: cli.dev,
        log_dir: Some(config.yggdrasil_log_dir.clone()),
    });

    let manual_submit = matches!(
        cli.command,
        Commands::RunDoc {
            manual_submit: true,
            ..
        }
    );
    let session = SessionFlags::new(cli.dev, manual_submit);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    runtime.block_on(async move {
        let ctx = bootstrap(config, session).await.context("startup failed")?;

        match cli.command {
            Commands::Daemon => {
                Daemon::new(ctx).run().await?;
                Ok(ExitCode::SUCCESS)
            }
            Commands::RunDoc { doc_id, .. } => {
                let report = run_doc(ctx, &doc_id).await;
                println!("{}", report);
                Ok(if report.succeeded() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                })
            }
        }
    })
}
