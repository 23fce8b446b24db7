//! Command line entry point

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::audio::{CpalBackend, Surface, TerminalSurface};
use crate::diagnostics::{DiagnosticsLog, LogEntry};
use crate::session::{Recorder, SessionConfig, SessionDeps, TeardownReport};
use crate::settings::{AppSettings, SettingsStore};
use crate::streaming::{
    fetch_stream_token, ConnectionConfig, ConnectionManager, ConnectionState, Endpoint,
    EndpointKind, TranscriptAggregator, WsConnector,
};

/// Scope size in terminal cells
const SCOPE_WIDTH: usize = 96;
const SCOPE_HEIGHT: usize = 16;

/// Rate announced by `check` when no capture rate is configured
const CHECK_SAMPLE_RATE: u32 = 48000;

#[derive(Debug, Parser)]
#[command(
    name = "micstream",
    version,
    about = "Stream the microphone as PCM16 over WebSocket"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record until Ctrl-C (or --duration) and stream every frame
    Record {
        /// Endpoint URL for this run (saved after a successful connect)
        #[arg(long)]
        url: Option<String>,
        #[arg(long, value_enum)]
        endpoint: Option<EndpointArg>,
        /// Draw the live waveform in the terminal
        #[arg(long)]
        scope: bool,
        /// Stop after this many seconds
        #[arg(long, value_name = "SECS")]
        duration: Option<u64>,
        /// Print the diagnostics log when done
        #[arg(long)]
        show_log: bool,
    },
    /// Test the connection and save the URL if it works
    Check {
        #[arg(long)]
        url: Option<String>,
    },
    /// Validate and save the endpoint URL
    SetUrl { url: String },
    /// Print the settings file location and effective settings
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EndpointArg {
    Raw,
    Transcription,
}

impl From<EndpointArg> for EndpointKind {
    fn from(arg: EndpointArg) -> Self {
        match arg {
            EndpointArg::Raw => EndpointKind::Raw,
            EndpointArg::Transcription => EndpointKind::Transcription,
        }
    }
}

/// Parse arguments, run the command, map the outcome to an exit code.
pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command) -> Result<(), String> {
    let store = SettingsStore::default_location()?;

    match command {
        Command::Record {
            url,
            endpoint,
            scope,
            duration,
            show_log,
        } => {
            let mut settings = store.load().with_env_overrides();
            apply_overrides(&mut settings, url, endpoint);
            record(settings, store, scope, duration.map(Duration::from_secs), show_log).await
        }
        Command::Check { url } => {
            let mut settings = store.load().with_env_overrides();
            apply_overrides(&mut settings, url, None);
            check(settings, store).await
        }
        Command::SetUrl { url } => {
            let settings = store.load();
            let endpoint = Endpoint::parse(settings.endpoint, &url).map_err(|e| e.to_string())?;
            store.save_ws_url(url.trim())?;
            println!("Saved endpoint {}", endpoint.url());
            Ok(())
        }
        Command::Config => {
            let settings = store.load().with_env_overrides();
            let json = serde_json::to_string_pretty(&settings).map_err(|e| e.to_string())?;
            println!("# {}", store.path().display());
            println!("{}", json);
            Ok(())
        }
    }
}

fn apply_overrides(settings: &mut AppSettings, url: Option<String>, endpoint: Option<EndpointArg>) {
    if let Some(url) = url {
        settings.ws_url = url.trim().to_string();
    }
    if let Some(endpoint) = endpoint {
        settings.endpoint = endpoint.into();
    }
}

async fn record(
    settings: AppSettings,
    store: SettingsStore,
    scope: bool,
    duration: Option<Duration>,
    show_log: bool,
) -> Result<(), String> {
    let config = SessionConfig::prepare(&settings)
        .await
        .map_err(|e| e.to_string())?;
    let log = Arc::new(DiagnosticsLog::new(settings.log_capacity));

    let surface: Option<Box<dyn Surface>> = if scope {
        // Clear once; the surface redraws in place from the top-left
        print!("\x1b[2J");
        Some(Box::new(TerminalSurface::new(SCOPE_WIDTH, SCOPE_HEIGHT)))
    } else {
        None
    };

    let deps = SessionDeps {
        backend: Arc::new(CpalBackend),
        connector: Arc::new(WsConnector::new()),
        log: log.clone(),
        surface,
        store: Some(store),
    };

    let mut recorder = Recorder::new();
    let session = recorder
        .start(config, deps)
        .await
        .map_err(|e| e.to_string())?;
    log::info!(
        "Recording at {} Hz to {} (Ctrl-C to stop)",
        session.sample_rate(),
        settings.ws_url
    );

    let printer = session.take_transcripts().map(|mut transcripts| {
        tokio::spawn(async move {
            let mut aggregator = TranscriptAggregator::new();
            while let Some(transcript) = transcripts.recv().await {
                let text = aggregator.process(&transcript);
                if transcript.is_final && !scope {
                    println!("{}", text);
                } else {
                    log::debug!("Interim: {}", text);
                }
            }
            aggregator.settled_text().to_string()
        })
    });

    match duration {
        Some(limit) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
                _ = tokio::time::sleep(limit) => log::info!("Duration elapsed"),
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::warn!("Could not listen for Ctrl-C: {}", e);
            }
        }
    }

    let report = recorder.stop().await.map_err(|e| e.to_string())?;

    let transcript = match printer {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    print_report(&report);
    if !transcript.is_empty() {
        println!("Transcript: {}", transcript);
    }
    if show_log {
        print_log(&log.snapshot());
    }

    if report.is_clean() {
        Ok(())
    } else {
        Err(report.errors.join("; "))
    }
}

async fn check(settings: AppSettings, store: SettingsStore) -> Result<(), String> {
    let endpoint =
        Endpoint::parse(settings.endpoint, &settings.ws_url).map_err(|e| e.to_string())?;

    let token = match (endpoint.kind(), settings.token_url.as_deref()) {
        (EndpointKind::Transcription, Some(token_url)) => {
            Some(fetch_stream_token(token_url).await.map_err(|e| e.to_string())?)
        }
        _ => None,
    };

    let log = Arc::new(DiagnosticsLog::new(settings.log_capacity));
    let manager = ConnectionManager::spawn(
        Arc::new(WsConnector::new()),
        log.clone(),
        ConnectionConfig {
            endpoint: endpoint.kind(),
            connect_timeout: settings.connect_timeout(),
        },
    );

    let sample_rate = settings.sample_rate.unwrap_or(CHECK_SAMPLE_RATE);
    let state = manager
        .connect_and_wait(endpoint.request(sample_rate, token.as_deref()))
        .await;

    if state == ConnectionState::Connected {
        store.save_ws_url(endpoint.url())?;
    }
    manager.shutdown().await;

    print_log(&log.snapshot());

    match state {
        ConnectionState::Connected => {
            println!("OK: {} is reachable", endpoint.url());
            Ok(())
        }
        other => Err(format!("{} is not reachable ({})", endpoint.url(), other)),
    }
}

fn print_report(report: &TeardownReport) {
    println!(
        "Recorded {:.1}s: {} frames sent, {} dropped",
        report.recorded_ms as f64 / 1000.0,
        report.stream.frames_sent,
        report.stream.frames_dropped
    );
    for error in &report.errors {
        println!("  teardown: {}", error);
    }
}

fn print_log(entries: &[LogEntry]) {
    for entry in entries {
        println!(
            "{} [{:>9}] {}",
            entry.timestamp.format("%H:%M:%S%.3f"),
            entry.category.as_str(),
            entry.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_record_flags() {
        let cli = Cli::try_parse_from([
            "micstream",
            "record",
            "--url",
            "ws://10.0.0.2:8080",
            "--endpoint",
            "transcription",
            "--scope",
            "--duration",
            "30",
        ])
        .unwrap();

        match cli.command {
            Command::Record {
                url,
                endpoint,
                scope,
                duration,
                show_log,
            } => {
                assert_eq!(url.as_deref(), Some("ws://10.0.0.2:8080"));
                assert!(matches!(endpoint, Some(EndpointArg::Transcription)));
                assert!(scope);
                assert_eq!(duration, Some(30));
                assert!(!show_log);
            }
            other => panic!("Expected Record, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_set_url() {
        let cli = Cli::try_parse_from(["micstream", "set-url", "wss://a.example/pcm"]).unwrap();
        assert!(matches!(cli.command, Command::SetUrl { url } if url == "wss://a.example/pcm"));
    }

    #[test]
    fn test_apply_overrides() {
        let mut settings = AppSettings::default();
        apply_overrides(
            &mut settings,
            Some(" ws://override:9 ".to_string()),
            Some(EndpointArg::Transcription),
        );
        assert_eq!(settings.ws_url, "ws://override:9");
        assert_eq!(settings.endpoint, EndpointKind::Transcription);
    }
}
