//! CLI command implementations

use crate::relay;
use anyhow::{bail, Context, Result};
use coderun_sandbox::{
    build_backend, EngineConfig, ExecutionPipeline, ExecutionRequest, ExecutionResult, Outcome,
    SandboxError, SessionEvent, SessionManager, StreamKind,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

const MIB: u64 = 1024 * 1024;

/// Exit status used when the program itself could not be judged
const FAILURE_EXIT: u8 = 1;

/// Arguments of `coderun run`
pub struct RunArgs {
    pub language: String,
    pub file: PathBuf,
    pub stdin: Option<String>,
    pub stdin_file: Option<PathBuf>,
    pub timeout: u64,
    pub memory_mb: Option<u64>,
    pub json: bool,
}

/// Load and validate the configuration, falling back to defaults
///
/// # Arguments
/// * `path` - Optional TOML file given with `--config`
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            let config = EngineConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            debug!("Loaded config from {}", path.display());
            Ok(config)
        }
        None => {
            let config = EngineConfig::default();
            config.validate().context("Default config is invalid")?;
            Ok(config)
        }
    }
}

fn build_pipeline(config: EngineConfig) -> Result<Arc<ExecutionPipeline>> {
    let pipeline = ExecutionPipeline::new(config).context("Failed to initialise execution engine")?;
    Ok(Arc::new(pipeline))
}

async fn read_source(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut source = String::new();
        tokio::io::stdin()
            .read_to_string(&mut source)
            .await
            .context("Failed to read program from stdin")?;
        return Ok(source);
    }
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read source file {}", file.display()))
}

/// Execute the `run` command
///
/// Prints the program's stdout and stderr as-is and exits with the
/// program's exit code. Timeouts and compile failures exit non-zero with a
/// note on stderr. Ctrl-C kills the program and removes its workspace.
pub async fn execute_run(config: EngineConfig, args: RunArgs) -> Result<ExitCode> {
    let pipeline = build_pipeline(config)?;
    let backend = build_backend(&pipeline).context("Failed to initialise backend")?;

    let source = read_source(&args.file).await?;
    let stdin = match (&args.stdin, &args.stdin_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read stdin file {}", path.display()))?,
        (None, None) => String::new(),
    };

    let mut request = ExecutionRequest::new(&args.language, source)
        .with_stdin(stdin)
        .with_timeout(args.timeout);
    if let Some(mb) = args.memory_mb {
        request = request.with_memory_limit(mb.saturating_mul(MIB));
    }

    info!("Running {} program via {} backend", args.language, backend.name());
    let outcome = tokio::select! {
        result = backend.execute(request) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; program killed");
            return Ok(ExitCode::from(130));
        }
    };

    let result = match outcome {
        Ok(result) => result,
        Err(err) if err.is_caller_error() => bail!(err),
        Err(err) => {
            error!("Execution failed: {}", err);
            ExecutionResult::internal_error(err.public_message())
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result)?;
    }
    Ok(ExitCode::from(exit_status_for(&result)))
}

fn print_result(result: &ExecutionResult) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(result.stdout.as_bytes())?;
    stdout.flush()?;

    let mut stderr = std::io::stderr().lock();
    stderr.write_all(result.stderr.as_bytes())?;
    match result.outcome {
        Outcome::Completed if result.exit_code != 0 => {
            writeln!(stderr, "✗ Program exited with code {}", result.exit_code)?;
        }
        Outcome::Completed => {}
        Outcome::TimedOut => writeln!(stderr, "✗ Time limit exceeded")?,
        Outcome::CompileFailed => {
            stderr.write_all(result.compile_output.as_bytes())?;
            if !result.compile_output.ends_with('\n') {
                writeln!(stderr)?;
            }
            writeln!(stderr, "✗ Compilation failed")?;
        }
        Outcome::InternalError => writeln!(stderr, "✗ Internal error")?,
    }
    if result.truncated {
        writeln!(stderr, "✗ Output truncated")?;
    }
    Ok(())
}

fn exit_status_for(result: &ExecutionResult) -> u8 {
    match result.outcome {
        Outcome::Completed => u8::try_from(result.exit_code).unwrap_or(FAILURE_EXIT),
        _ => FAILURE_EXIT,
    }
}

/// Execute the `session` command
///
/// Terminal lines are forwarded to the program as they are typed; EOF
/// closes its stdin and Ctrl-C ends the session.
pub async fn execute_session(config: EngineConfig, language: String, file: PathBuf) -> Result<ExitCode> {
    let pipeline = build_pipeline(config)?;
    let manager = SessionManager::new(pipeline);
    let source = read_source(&file).await?;

    let id = manager
        .open(&language, &source)
        .await
        .context("Failed to open session")?;
    let mut events = manager.receive_output(id)?;
    info!("Session {} started", id);

    let mut printer = tokio::spawn(async move {
        let mut exit = ExitCode::from(FAILURE_EXIT);
        while let Some(event) = events.next().await {
            match event {
                SessionEvent::Output { stream: StreamKind::Stdout, data } => {
                    let mut out = std::io::stdout().lock();
                    let _ = out.write_all(data.as_bytes()).and_then(|_| out.flush());
                }
                SessionEvent::Output { stream: StreamKind::Stderr, data } => {
                    eprint!("{}", data);
                }
                SessionEvent::CompileFailed { output, timed_out } => {
                    eprint!("{}", output);
                    if timed_out {
                        eprintln!();
                    }
                    eprintln!("✗ Compilation failed");
                }
                SessionEvent::Exited { exit_code } => {
                    eprintln!("✓ Program exited with code {}", exit_code);
                    exit = ExitCode::from(u8::try_from(exit_code).unwrap_or(FAILURE_EXIT));
                }
                SessionEvent::Closed { reason } => {
                    eprintln!("✗ Session closed ({:?})", reason);
                }
            }
        }
        exit
    });
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let exit = loop {
        tokio::select! {
            exit = &mut printer => break exit.unwrap_or(ExitCode::from(FAILURE_EXIT)),
            _ = tokio::signal::ctrl_c() => {
                manager.close(id).await?;
                break printer.await.unwrap_or(ExitCode::from(FAILURE_EXIT));
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match manager.send_input(id, &line).await {
                    Ok(()) => {}
                    Err(SandboxError::InvalidSessionState { .. }) => stdin_open = false,
                    Err(err) => return Err(err.into()),
                },
                None => {
                    stdin_open = false;
                    // The program may already be gone
                    let _ = manager.close_input(id).await;
                }
            },
        }
    };

    manager.close(id).await?;
    Ok(exit)
}

/// Execute the `relay` command
pub async fn execute_relay(config: EngineConfig) -> Result<ExitCode> {
    let pipeline = build_pipeline(config)?;
    let backend = build_backend(&pipeline).context("Failed to initialise backend")?;
    let manager = Arc::new(SessionManager::new(pipeline));

    info!("Relay listening on stdin");
    relay::run_relay(
        manager,
        backend,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await?;
    info!("Relay input closed");
    Ok(ExitCode::SUCCESS)
}

/// Execute the `languages` command
pub fn execute_languages(config: EngineConfig) -> Result<ExitCode> {
    let pipeline = build_pipeline(config)?;
    let preview = coderun_sandbox::TemplateContext {
        memory_mb: pipeline.config().sandbox.run_limits.memory_mb(),
    };
    for spec in pipeline.registry().languages() {
        let aliases = spec.language.aliases().join(", ");
        println!("{} ({})", spec.language, spec.source_file);
        if !aliases.is_empty() {
            println!("  aliases: {}", aliases);
        }
        if let Some(compile) = &spec.compile {
            println!("  compile: {}", compile.render(&preview).join(" "));
        }
        println!("  run:     {}", spec.run.render(&preview).join(" "));
    }
    Ok(ExitCode::SUCCESS)
}

/// Execute the `config` command
pub fn execute_config(config: &EngineConfig) -> Result<ExitCode> {
    let rendered = config.to_toml_string()?;
    print!("{}", rendered);
    Ok(ExitCode::SUCCESS)
}
