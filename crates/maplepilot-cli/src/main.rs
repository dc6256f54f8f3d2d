//! maplepilot agent, executor and one-shot input commands.

mod agent;
mod args;
mod backend;
mod config;
mod executor;
mod paths;
mod wire;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use maplepilot_core::error::ApiError;
use maplepilot_core::input::{InputRequest, KeyTiming};
use maplepilot_core::player::MachineStatus;
use maplepilot_core::settings::{BackendKind, Settings};
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info};

use crate::agent::{run_feed, ConnectionState, ControlLoop, FeedDetector, Session, StatusReport};
use crate::args::{AgentArgs, BackendArgs, Cli, Commands, ExecutorArgs, KeyStateArgs, SendKeyArgs};
use crate::backend::{KeyInjector, TracingInjector};
use crate::executor::{ExecutorConfig, ExecutorServer, MAX_DOWN_MS};

/// Queue depth between the stdin feed and the control loop.
const COMMAND_QUEUE: usize = 64;

fn main() {
    // Logs go to stderr; stdout carries status lines and command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings_path = paths::get_settings_path(cli.config.as_deref());
    let settings = config::load_settings(&settings_path)?;

    // Commands that never touch the runtime
    match &cli.command {
        Commands::Config => {
            print!("{}", config::render_settings(&settings)?);
            return Ok(());
        }
        Commands::Seed => {
            let path = paths::get_seed_path();
            let (seed, created) = config::load_or_create_seed(&path)?;
            println!("{}", seed.to_hex());
            if created {
                info!("Stored new seed at {:?}", path);
            }
            return Ok(());
        }
        _ => {}
    }

    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Agent(args) => run_agent(settings, args).await,
            Commands::Executor(args) => run_executor(settings, args).await,
            Commands::SendKey(args) => send_key(settings, args).await,
            Commands::KeyState(args) => key_state(settings, args).await,
            Commands::Config | Commands::Seed => Ok(()),
        }
    })
}

fn apply_overrides(mut settings: Settings, overrides: &BackendArgs) -> anyhow::Result<Settings> {
    overrides.apply(&mut settings);
    settings.validate().context("Invalid backend override")?;
    Ok(settings)
}

fn open_session(settings: &Settings) -> anyhow::Result<Arc<Session>> {
    let (seed, _) = config::load_or_create_seed(&paths::get_seed_path())?;
    let injector: Arc<dyn KeyInjector> = Arc::new(TracingInjector::new());
    Ok(Arc::new(Session::new(settings, seed, injector)))
}

/// Run the bot until stdin closes, a shutdown command arrives, or a signal.
async fn run_agent(settings: Settings, args: AgentArgs) -> anyhow::Result<()> {
    let settings = apply_overrides(settings, &args.backend)?;
    let session = open_session(&settings)?;

    let manager_shutdown = Arc::new(Notify::new());
    let manager = session.spawn_connection_manager(manager_shutdown.clone());

    let detector = FeedDetector::new();
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
    let (control, status) = ControlLoop::new(
        settings,
        session.clone(),
        Box::new(detector.clone()),
        commands_rx,
    )?;

    let mut feed = tokio::spawn(run_feed(
        BufReader::new(tokio::io::stdin()),
        detector,
        commands_tx,
    ));
    let printer = tokio::spawn(print_status(status));

    let stop = Arc::new(Notify::new());
    let mut control_task = tokio::spawn(control.run(stop.clone()));

    tokio::select! {
        result = &mut control_task => {
            if let Err(e) = result {
                error!("Control loop failed: {}", e);
            }
        }
        _ = &mut feed => {
            info!("Stdin closed, stopping agent");
            stop.notify_one();
            let _ = control_task.await;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully");
            stop.notify_one();
            // Held keys are released before the loop returns.
            let _ = control_task.await;
        }
        _ = sigterm() => {
            info!("Received SIGTERM, shutting down gracefully");
            stop.notify_one();
            let _ = control_task.await;
        }
    }

    manager_shutdown.notify_one();
    let _ = manager.await;
    feed.abort();
    // The status sender is gone with the control loop; the printer drains and exits.
    let _ = printer.await;
    info!("Agent stopped");
    Ok(())
}

/// What a status line is printed for. Action timers change every tick and
/// would flood stdout.
#[derive(PartialEq)]
struct Headline {
    machine: MachineStatus,
    connection: ConnectionState,
    attention: Option<ApiError>,
    latest_warning: Option<ApiError>,
    warnings: usize,
}

impl Headline {
    fn of(report: &StatusReport) -> Self {
        Self {
            machine: report.machine.clone(),
            connection: report.connection.clone(),
            attention: report.attention.clone(),
            latest_warning: report.warnings.last().cloned(),
            warnings: report.warnings.len(),
        }
    }
}

/// Print a JSON status line whenever the headline changes.
async fn print_status(mut status: watch::Receiver<StatusReport>) {
    let mut last: Option<Headline> = None;
    loop {
        let line = {
            let report = status.borrow_and_update();
            let headline = Headline::of(&report);
            if last.as_ref() == Some(&headline) {
                None
            } else {
                last = Some(headline);
                Some(serde_json::to_string(&*report))
            }
        };

        match line {
            Some(Ok(line)) => println!("{}", line),
            Some(Err(e)) => error!("Failed to serialize status: {}", e),
            None => {}
        }

        if status.changed().await.is_err() {
            return;
        }
    }
}

/// Serve the remote input protocol until a signal arrives.
async fn run_executor(settings: Settings, args: ExecutorArgs) -> anyhow::Result<()> {
    let config = ExecutorConfig {
        injector: Arc::new(TracingInjector::new()),
        coordinate_mode: args
            .coordinate_mode
            .map(Into::into)
            .unwrap_or(settings.coordinate_mode),
        window: settings.window,
        timing: settings.timing,
    };

    let server = ExecutorServer::bind(&args.listen, config).await?;
    let shutdown = server.shutdown_handle();
    let run = server.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => return result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully");
        }
        _ = sigterm() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
    }

    // Let open connections release their held keys.
    shutdown.notify_one();
    run.await
}

async fn send_key(settings: Settings, args: SendKeyArgs) -> anyhow::Result<()> {
    if args.hold > MAX_DOWN_MS {
        return Err(ApiError::invalid_input(format!(
            "Hold of {}ms exceeds the {}ms limit",
            args.hold, MAX_DOWN_MS
        ))
        .into());
    }

    let settings = apply_overrides(settings, &args.backend)?;
    let session = open_session(&settings)?;
    let backend = session.connect().await?;
    let mut timing = KeyTiming::from_seed(session.seed(), settings.timing);

    for press in 0..args.count {
        if press > 0 {
            tokio::time::sleep(timing.next_gap()).await;
        }
        let down_ms = match args.hold {
            0 => timing.next_down_ms(),
            hold => hold,
        };
        backend
            .send(&InputRequest::key(args.key, down_ms))
            .await
            .map_err(ApiError::from)?;
    }

    println!(
        "{}",
        serde_json::json!({
            "key": args.key,
            "presses": args.count,
            "backend": backend.kind(),
        })
    );
    Ok(())
}

async fn key_state(settings: Settings, args: KeyStateArgs) -> anyhow::Result<()> {
    let settings = apply_overrides(settings, &args.backend)?;
    let session = open_session(&settings)?;
    let backend = session.connect().await?;
    let pressed = backend.key_state(args.key).await.map_err(ApiError::from)?;

    if backend.kind() == BackendKind::Local {
        info!("Local key state only reflects keys this process pressed");
    }
    println!(
        "{}",
        serde_json::json!({ "key": args.key, "pressed": pressed })
    );
    Ok(())
}

/// Wait for SIGTERM signal (Unix only).
///
/// If signal registration fails, logs a warning and waits indefinitely.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(
                "Failed to register SIGTERM handler: {}, only SIGINT will stop the process",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM is not available on non-Unix platforms; use a never-completing future.
#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
