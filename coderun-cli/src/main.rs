mod commands;
mod logging;
mod relay;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "coderun")]
#[command(about = "Compile and run untrusted programs in a sandbox")]
#[command(version)]
pub struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile (if needed) and run one program
    Run {
        /// Language id or alias (python, cpp, c, java, javascript, shell)
        #[arg(short, long)]
        language: String,

        /// Source file; `-` reads the program from stdin
        file: PathBuf,

        /// Text fed to the program's stdin
        #[arg(long, conflicts_with = "stdin_file")]
        stdin: Option<String>,

        /// File fed to the program's stdin
        #[arg(long)]
        stdin_file: Option<PathBuf>,

        /// Run timeout in seconds (clamped by configuration)
        #[arg(short, long, default_value_t = coderun_common::DEFAULT_TIMEOUT_SECS)]
        timeout: u64,

        /// Memory ceiling in MiB; can only tighten the configured limit
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start a program and relay terminal input to it line by line
    Session {
        /// Language id or alias
        #[arg(short, long)]
        language: String,

        /// Source file
        file: PathBuf,
    },
    /// Speak line-delimited JSON frames on stdin/stdout
    Relay,
    /// List supported languages and their commands
    Languages,
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = logging::init_logging(cli.verbose, cli.log_file.as_deref())?;
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            language,
            file,
            stdin,
            stdin_file,
            timeout,
            memory_mb,
            json,
        } => {
            commands::execute_run(
                config,
                commands::RunArgs {
                    language,
                    file,
                    stdin,
                    stdin_file,
                    timeout,
                    memory_mb,
                    json,
                },
            )
            .await
        }
        Commands::Session { language, file } => {
            commands::execute_session(config, language, file).await
        }
        Commands::Relay => commands::execute_relay(config).await,
        Commands::Languages => commands::execute_languages(config),
        Commands::Config => commands::execute_config(&config),
    }
}
