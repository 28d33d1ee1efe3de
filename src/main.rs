use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use patchrun::{
    ExecutionStrategy, InstallPhase, ProcessSupervisor, ProgressEvent, ScriptInvocation,
};

/// Run a patch install script and report structured progress
#[derive(Parser)]
#[command(name = "patchrun", version)]
#[command(about = "Supervise a patch install script and stream its progress", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch an install script and stream its progress until it exits
    Run {
        /// Path to the install script
        script: PathBuf,

        /// Working directory for the script (defaults to the script's parent)
        #[arg(short = 'd', long)]
        working_dir: Option<PathBuf>,

        /// How the script's output is captured
        #[arg(long, value_enum, default_value_t = StrategyArg::DirectPipe)]
        strategy: StrategyArg,

        /// Log file for the shell-redirect strategy (defaults to
        /// patchrun_script_log.txt in the working directory)
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Patch the script to disable IPv6 downloads before launching
        #[arg(long)]
        disable_ipv6: bool,

        /// Emit progress events as JSON lines instead of human-readable text
        #[arg(long)]
        json: bool,

        /// Write the collapsed output transcript to this file on exit
        #[arg(long)]
        transcript: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    /// Pipe the script's stdout straight into the supervisor
    DirectPipe,
    /// Run through the shell with output redirected to a polled log file
    ShellRedirect,
}

impl From<StrategyArg> for ExecutionStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::DirectPipe => ExecutionStrategy::DirectPipe,
            StrategyArg::ShellRedirect => ExecutionStrategy::ShellRedirectToFile,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(cli.verbose >= 2)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run {
            script,
            working_dir,
            strategy,
            log_file,
            disable_ipv6,
            json,
            transcript,
        } => {
            run_script(
                script,
                working_dir,
                strategy,
                log_file,
                disable_ipv6,
                json,
                transcript,
            )
            .await
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_script(
    script: PathBuf,
    working_dir: Option<PathBuf>,
    strategy: StrategyArg,
    log_file: Option<PathBuf>,
    disable_ipv6: bool,
    json: bool,
    transcript: Option<PathBuf>,
) -> Result<i32> {
    let working_dir = match working_dir {
        Some(dir) => dir,
        None => script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let invocation = ScriptInvocation::new(&script, working_dir)
        .with_strategy(strategy.into())
        .with_log_file(log_file)
        .with_disable_ipv6(disable_ipv6);

    let mut supervisor = ProcessSupervisor::new(invocation);
    let mut events = supervisor
        .launch()
        .await
        .with_context(|| format!("launching {}", script.display()))?;

    let mut renderer = EventRenderer::new(json);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => renderer.render(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted; terminating script process tree");
                supervisor.terminate().await;
            }
        }
    }

    let status = supervisor.wait().await?;
    debug!("supervisor reached {:?}", supervisor.state());

    if let Some(path) = transcript {
        std::fs::write(&path, supervisor.transcript())
            .with_context(|| format!("writing transcript to {}", path.display()))?;
    }

    if !json {
        if status.success() {
            println!("Install script finished successfully");
        } else {
            println!("Install script failed with status {status:?}");
        }
    }
    Ok(status.code().unwrap_or(1))
}

/// Renders events for a terminal, tracking phase transitions so the
/// previous download phase can be marked done the way the installer UI
/// does.
struct EventRenderer {
    json: bool,
    current_phase: Option<InstallPhase>,
}

impl EventRenderer {
    fn new(json: bool) -> Self {
        Self {
            json,
            current_phase: None,
        }
    }

    fn render(&mut self, event: &ProgressEvent) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(err) => debug!("could not serialize event: {err}"),
            }
            return;
        }

        match event {
            ProgressEvent::DownloadProgress {
                received,
                total,
                speed,
                eta,
                percent,
            } => {
                println!("{received}/{total} ({percent:.0}%) - {speed} - {eta}");
            }
            ProgressEvent::VerificationProgress {
                verified,
                total,
                percent,
            } => {
                println!("Verifying... {verified}/{total} ({percent:.0}%)");
            }
            ProgressEvent::PhaseChanged { phase, detail } => {
                self.render_phase_change(*phase, detail.as_deref());
            }
            ProgressEvent::PlainLine { text } => println!("{text}"),
        }
    }

    fn render_phase_change(&mut self, phase: InstallPhase, detail: Option<&str>) {
        if let Some(previous) = self.current_phase {
            if previous != phase {
                if let Some(label) = download_phase_label(previous) {
                    println!("{label} (Done)");
                }
            }
        }
        self.current_phase = Some(phase);

        match phase {
            InstallPhase::GraphicsPatch => println!("Downloading graphics patch..."),
            InstallPhase::VoicePatch => println!("Downloading voice patch..."),
            InstallPhase::GenericPatch => println!("Downloading patch..."),
            InstallPhase::FinishingDownload => println!("Finishing downloading file..."),
            InstallPhase::Extracting => match detail {
                Some(detail) => println!("{detail}"),
                None => println!("Extracting and installing files..."),
            },
            InstallPhase::MovingFolders => {
                println!("Moving files... (this may take a while)")
            }
            InstallPhase::Completed => println!("Install complete!"),
        }
    }
}

fn download_phase_label(phase: InstallPhase) -> Option<&'static str> {
    match phase {
        InstallPhase::GraphicsPatch => Some("Downloading graphics patch..."),
        InstallPhase::VoicePatch => Some("Downloading voice patch..."),
        InstallPhase::GenericPatch => Some("Downloading patch..."),
        _ => None,
    }
}
