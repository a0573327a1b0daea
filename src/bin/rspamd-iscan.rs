//! rspamd-iscan daemon entry point

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rspamd_iscan::{retry, Analyzer, Config, ImapClient, ImapConfig, Scanner};

/// Abort after this many consecutive identical transient errors.
const MAX_RETRIES_SAME_ERROR: u32 = 20;

/// Pauses between reconnect attempts; the last entry repeats.
const RETRY_INTERVALS: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(300),
];

#[derive(Parser)]
#[command(name = "rspamd-iscan", version)]
#[command(about = "Scans IMAP mailboxes for spam via an Rspamd-compatible analyzer")]
struct Args {
    /// Path to the rspamd-iscan config file
    #[arg(long, default_value = "rspamd-iscan.toml")]
    cfg_file: PathBuf,

    /// Directory containing ImapPassword/AnalyzerPassword credential
    /// files (systemd LoadCredential style)
    #[arg(long)]
    credentials_directory: Option<PathBuf>,

    /// Process the ham, undetected and scan mailboxes once, then exit
    #[arg(long)]
    once: bool,

    /// Do not modify any mailbox, implies --once
    #[arg(long, short = 'n')]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // timestamps are left to journald/syslog, the daemon normally runs
    // under a service manager
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .without_time()
        .init();

    let args = Args::parse();

    let mut cfg = Config::from_file(&args.cfg_file)
        .with_context(|| format!("loading config file {} failed", args.cfg_file.display()))?;
    if let Some(dir) = &args.credentials_directory {
        cfg.apply_credentials_dir(dir)
            .with_context(|| format!("loading credentials from {} failed", dir.display()))?;
    }
    cfg.set_defaults();
    cfg.validate()?;

    info!("{}", cfg.summary());

    let analyzer = Analyzer::new(&cfg.analyzer_url, cfg.analyzer_password.clone());
    let stop = CancellationToken::new();

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received, stopping");
            stop.cancel();
        });
    }

    if args.once || args.dry_run {
        return run_once(&cfg, analyzer, args.dry_run, stop).await;
    }

    let runner = retry::Runner {
        is_retryable: retry::is_transient,
        max_retries_same_error: MAX_RETRIES_SAME_ERROR,
        retry_intervals: RETRY_INTERVALS.to_vec(),
    };

    let res = runner
        .run(|| {
            let cfg = cfg.clone();
            let analyzer = analyzer.clone();
            let stop = stop.clone();

            async move {
                if stop.is_cancelled() {
                    return Ok(());
                }

                let imap = ImapClient::connect(&imap_config(&cfg, false)).await?;
                let mut scanner = Scanner::new(&cfg, imap, analyzer, stop);

                let res = scanner.monitor().await;
                if let Err(err) = scanner.close().await {
                    error!(error = %err, "closing imap connection failed");
                }

                res
            }
        })
        .await;

    res?;
    Ok(())
}

async fn run_once(
    cfg: &Config,
    analyzer: Analyzer,
    dry_run: bool,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    let imap = ImapClient::connect(&imap_config(cfg, dry_run)).await?;
    let mut scanner = Scanner::new(cfg, imap, analyzer, stop);

    let res = scanner.run_once().await;
    if let Err(err) = scanner.close().await {
        error!(error = %err, "closing imap connection failed");
    }

    res?;
    Ok(())
}

fn imap_config(cfg: &Config, dry_run: bool) -> ImapConfig {
    ImapConfig {
        address: cfg.imap_address.clone(),
        user: cfg.imap_user.clone(),
        password: cfg.imap_password.clone(),
        allow_insecure: cfg.allow_insecure,
        dry_run,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
