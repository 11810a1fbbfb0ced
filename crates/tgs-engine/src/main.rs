mod cli;
mod events;
mod logging;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tgs_engine_backend::{CancellationToken, EngineError, ProgressReporter};
use tgs_engine_installer::PlatformInstaller;
use tgs_engine_manager::{CustomArchive, EngineManager};
use tgs_engine_platform::{AppPaths, AppPathsError};
use thiserror::Error;

use crate::cli::{Cli, Commands};
use crate::events::LogEventConsumer;
use crate::settings::AppSettings;

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Paths(#[from] AppPathsError),
    #[error("failed to open custom archive {path}: {source}")]
    CustomArchive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl AppError {
    fn exit_code(&self) -> ExitCode {
        match self {
            Self::Engine(EngineError::Cancelled) => ExitCode::from(130),
            _ => ExitCode::FAILURE,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match AppPaths::new() {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = paths.ensure_dirs() {
        eprintln!("Failed to create application directories: {e}");
    }

    let settings_path = cli
        .global
        .config
        .clone()
        .unwrap_or_else(|| paths.settings_file());
    let (settings, settings_error) = match AppSettings::load(&settings_path) {
        Ok(settings) => (settings, None),
        Err(e) => (AppSettings::default(), Some(e)),
    };

    logging::init_logging(
        &paths.log_file(),
        settings.debug_logging || cli.global.verbose,
        settings.max_log_size_bytes,
    );
    if let Some(e) = settings_error {
        warn!("Using default settings: {e}");
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling");
                cancel.cancel();
            }
        }
    });

    match run(cli.command, &settings, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}

async fn run(
    command: Commands,
    settings: &AppSettings,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    let root = settings.engine.resolve_install_root()?;
    let installer = PlatformInstaller::select(&settings.engine.installer_options())?;
    let manager = EngineManager::start(
        root,
        Arc::new(installer),
        Arc::new(LogEventConsumer),
        cancel,
    )
    .await?;

    match command {
        Commands::List => {
            let active = manager.active_version();
            for version in manager.installed_versions() {
                let marker = if active.as_ref() == Some(&version) {
                    "*"
                } else {
                    " "
                };
                println!("{marker} {version}");
            }
        }
        Commands::Active => match manager.active_version() {
            Some(version) => println!("{version}"),
            None => return Err(EngineError::NoVersionsInstalled.into()),
        },
        Commands::Change {
            version,
            custom,
            no_install,
        } => {
            let archive = match custom {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .map_err(|source| AppError::CustomArchive { path, source })?;
                    Some(Box::new(file) as CustomArchive)
                }
                None => None,
            };
            let (progress, printer) = progress_printer();
            let result = manager
                .change_version(&progress, &version, archive, !no_install, cancel)
                .await;
            drop(progress);
            let _ = printer.await;
            println!("Active engine version: {}", result?);
        }
        Commands::Delete { version } => {
            manager
                .delete_version(&ProgressReporter::disabled(), &version, cancel)
                .await?;
            println!("Deleted {version}");
        }
        Commands::Use { version, trust } => {
            let lease = manager
                .use_executables(version.as_ref(), trust.as_deref(), cancel)
                .await?;
            println!("version:     {}", lease.key());
            println!("server:      {}", lease.server_path().display());
            println!("compiler:    {}", lease.compiler_path().display());
            println!("cli:         {}", lease.supports_cli());
            println!("map threads: {}", lease.supports_map_threads());
            println!("acquired:    {}", lease.acquired_at().to_rfc3339());
        }
    }

    Ok(())
}

/// A progress reporter whose updates are printed until it is dropped.
fn progress_printer() -> (ProgressReporter, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let printer = tokio::spawn(async move {
        let mut last = None;
        while let Some(percent) = rx.recv().await {
            if last != Some(percent) {
                eprintln!("{percent:>3}%");
                last = Some(percent);
            }
        }
    });
    (ProgressReporter::new(tx), printer)
}
