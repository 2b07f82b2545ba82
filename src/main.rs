//! local-translate command line
//!
//! Drives the same command boundary a desktop frontend would use. Workers
//! live only as long as one invocation, so `translate` loads its model first
//! and `tts say` always starts a fresh worker anyway.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use local_translate::commands::{self, Services, SynthesizeRequest, TranslateRequest};
use local_translate::download::DownloadProgress;
use local_translate::{CommandError, Config};
use local_translate::worker::{self, LoopbackBackend};
use std::future::Future;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "local-translate")]
#[command(author, version, about = "Offline translation and text-to-speech")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List supported translation languages
    Languages,

    /// List translation models and their status
    Models,

    /// Show the status of a translation model
    Status { model_id: String },

    /// Download a translation model
    Download { model_id: String },

    /// Load a translation model to check that it starts
    Load { model_id: String },

    /// Switch to another downloaded translation model
    Switch { model_id: String },

    /// Delete a downloaded translation model
    Delete { model_id: String },

    /// Translate text (reads stdin when no text is given)
    Translate {
        /// Source language code
        #[arg(short, long)]
        from: String,

        /// Target language code
        #[arg(short, long)]
        to: String,

        /// Model to translate with
        #[arg(short, long, default_value = "4b")]
        model: String,

        text: Vec<String>,
    },

    /// Text-to-speech
    Tts {
        #[command(subcommand)]
        command: TtsCommand,
    },

    /// Serve the worker protocol on stdin/stdout with the loopback backend
    #[command(hide = true)]
    Worker {
        /// Worker entry point passed by the supervisor (ignored)
        #[arg(hide = true)]
        entry: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum TtsCommand {
    /// Show the TTS model status
    Status,

    /// Download the TTS model
    Download,

    /// Load the TTS model to check that it starts
    Load,

    /// Synthesize speech into a WAV file
    Say {
        /// Language code of the text
        #[arg(short, long, default_value = "en")]
        language: String,

        /// Where to write the WAV file
        #[arg(short, long)]
        output: PathBuf,

        text: Vec<String>,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "local_translate=warn",
        1 => "local_translate=info",
        2 => "local_translate=debug",
        _ => "local_translate=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Command::Worker { .. } = cli.command {
        return run_worker();
    }

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config
        .ensure_directories()
        .context("Failed to create data directories")?;
    let services = Services::from_config(&config)?;

    let outcome = tokio::select! {
        result = run(cli.command, &services) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt signal, stopping workers...");
            services.abort();
            eprintln!("Interrupted");
            std::process::exit(130);
        }
    };

    let s = Arc::clone(&services);
    tokio::task::spawn_blocking(move || s.shutdown())
        .await
        .context("Worker shutdown failed")?;
    outcome
}

async fn run(command: Command, services: &Arc<Services>) -> Result<()> {
    match command {
        Command::Languages => {
            for language in commands::list_languages().await {
                println!("{:<4} {}", language.code, language.name);
            }
        }
        Command::Models => {
            for model in commands::list_models(services).await {
                println!(
                    "{:<8} {:<15} {:>3} GB  {}",
                    model.id,
                    model.status.as_str(),
                    model.ram_gb,
                    model.name
                );
                if let Some(error) = model.error {
                    println!("         error: {}", error);
                }
            }
        }
        Command::Status { model_id } => {
            let status = commands::get_model_status(services, &model_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Download { model_id } => {
            with_progress(|tx| commands::download_model(services, model_id.clone(), tx)).await?;
            println!("Downloaded {}", model_id);
        }
        Command::Load { model_id } => {
            let status = commands::load_model(services, model_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Switch { model_id } => {
            let status = commands::switch_model(services, model_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Delete { model_id } => {
            commands::delete_model(services, model_id.clone()).await?;
            println!("Deleted {}", model_id);
        }
        Command::Translate {
            from,
            to,
            model,
            text,
        } => {
            let text = input_text(text)?;
            commands::load_model(services, model).await?;
            let translated = commands::translate(
                services,
                TranslateRequest {
                    text,
                    source_lang: from,
                    target_lang: to,
                },
            )
            .await?;
            println!("{}", translated);
        }
        Command::Tts { command } => run_tts(command, services).await?,
        Command::Worker { .. } => return Err(anyhow!("worker runs outside the command loop")),
    }
    Ok(())
}

async fn run_tts(command: TtsCommand, services: &Arc<Services>) -> Result<()> {
    match command {
        TtsCommand::Status => {
            let status = commands::get_tts_status(services).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        TtsCommand::Download => {
            with_progress(|tx| commands::download_tts_model(services, tx)).await?;
            println!("Downloaded TTS model");
        }
        TtsCommand::Load => {
            let status = commands::load_tts_model(services).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        TtsCommand::Say {
            language,
            output,
            text,
        } => {
            if !commands::tts_supports_language(services, &language).await {
                tracing::warn!("TTS has no mapping for '{}', using auto-detect", language);
            }
            let text = input_text(text)?;
            let audio = commands::synthesize_speech(services, SynthesizeRequest { text, language }).await?;

            let bytes = base64::engine::general_purpose::STANDARD
                .decode(audio.trim())
                .context("Worker returned invalid base64 audio")?;
            let reader = hound::WavReader::new(std::io::Cursor::new(&bytes))
                .context("Worker returned audio that is not a WAV file")?;
            let spec = reader.spec();
            let seconds = reader.duration() as f32 / spec.sample_rate.max(1) as f32;

            std::fs::write(&output, &bytes)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "Wrote {} ({:.1}s, {} Hz, {} channel(s))",
                output.display(),
                seconds,
                spec.sample_rate,
                spec.channels
            );
        }
    }
    Ok(())
}

/// Worker process entry point
///
/// Frames go to a private copy of stdout; anything else printed to
/// descriptor 1 is discarded. Logs stay on stderr.
fn run_worker() -> Result<()> {
    let mut output = worker_output()?;
    let mut backend = LoopbackBackend::default();
    tracing::debug!("Loopback worker started (pid {})", std::process::id());
    worker::serve(&mut backend, std::io::stdin().lock(), &mut output)
        .context("Worker protocol stream failed")?;
    Ok(())
}

#[cfg(unix)]
fn worker_output() -> Result<Box<dyn Write>> {
    let output = worker::protocol_output().context("Failed to redirect stdout")?;
    Ok(Box::new(output))
}

#[cfg(not(unix))]
fn worker_output() -> Result<Box<dyn Write>> {
    Ok(Box::new(std::io::stdout()))
}

/// Run a download while printing its progress events to stderr
async fn with_progress<F, Fut>(start: F) -> Result<(), CommandError>
where
    F: FnOnce(UnboundedSender<DownloadProgress>) -> Fut,
    Fut: Future<Output = Result<(), CommandError>>,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<DownloadProgress>();
    let printer = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            eprintln!("[{:>3.0}%] {}", progress.fraction * 100.0, progress.message);
        }
    });
    let result = start(tx).await;
    let _ = printer.await;
    result
}

/// Join positional words, or read all of stdin when there are none
fn input_text(words: Vec<String>) -> Result<String> {
    if !words.is_empty() {
        return Ok(words.join(" "));
    }
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("Failed to read text from stdin")?;
    if text.trim().is_empty() {
        return Err(anyhow!("No text given"));
    }
    Ok(text)
}
