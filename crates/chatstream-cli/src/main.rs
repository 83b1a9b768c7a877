//! `chatstream`: stream a chat reply or run an auxiliary task from the
//! command line.
//!
//! ```bash
//! chatstream chat "Write a haiku about rust"
//! chatstream chat -p deepseek -m deepseek-chat --timeout 30 "Hello"
//! chatstream translate --to de "Good morning"
//! chatstream providers
//! ```
//!
//! Keys are read from the environment, and `.env` is loaded first.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chatstream_core::prelude::*;
use chatstream_core::{MessageTranslation, OperationUpdate, TaskOutcome, init_observability};
use chatstream_runtime::{EnvSource, Role};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chatstream")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file
    #[arg(short = 'c', long, env = "CHATSTREAM_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a chat reply to stdout
    Chat {
        #[arg(short, long, default_value = "openai")]
        provider: String,
        #[arg(short, long, default_value = "gpt-4o-mini")]
        model: String,
        /// Optional system prompt
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        temperature: Option<f64>,
        /// Cancel the generation after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        prompt: String,
    },
    /// Detect the language of a text and translate it
    Translate {
        /// Target language (defaults to the configured one)
        #[arg(long)]
        to: Option<String>,
        text: String,
    },
    /// Summarize a text
    Summarize {
        #[arg(long)]
        language: Option<String>,
        text: String,
    },
    /// List configured providers and whether they have credentials
    Providers,
}

struct App {
    settings: Settings,
    factory: RuntimeFactory,
    tracker: Arc<OperationTracker>,
    store: InMemoryMessageStore,
}

impl App {
    fn runtimes(&self) -> Result<Arc<RuntimeSet>> {
        let runtimes = RuntimeSet::from_settings(&self.settings, &self.factory)?;
        if runtimes.is_empty() {
            bail!("no provider is usable; set an API key such as OPENAI_API_KEY");
        }
        Ok(Arc::new(runtimes))
    }

    fn auxiliary(&self) -> Result<AuxiliaryPipeline> {
        Ok(AuxiliaryPipeline::new(
            self.tracker.clone(),
            Arc::new(self.store.clone()),
            self.runtimes()?,
            self.settings.system_agent.clone(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_observability();

    let args = Args::parse();
    let settings = Settings::load_or_default(args.config.as_deref(), &EnvSource::process())
        .context("failed to load settings")?;
    let app = App {
        factory: RuntimeFactory::new(settings.factory_config()),
        settings,
        tracker: Arc::new(OperationTracker::new()),
        store: InMemoryMessageStore::new(),
    };

    match args.command {
        Command::Chat {
            provider,
            model,
            system,
            temperature,
            timeout,
            prompt,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(prompt));
            let mut payload = ChatPayload::new(model, messages);
            if let Some(temperature) = temperature {
                payload = payload.temperature(temperature);
            }
            chat(&app, ProviderId::new(provider), payload, timeout).await
        }
        Command::Translate { to, text } => translate(&app, to, text).await,
        Command::Summarize { language, text } => summarize(&app, language, text).await,
        Command::Providers => {
            providers(&app);
            Ok(())
        }
    }
}

async fn chat(
    app: &App,
    provider: ProviderId,
    payload: ChatPayload,
    timeout: Option<u64>,
) -> Result<()> {
    let chat = ChatGeneration::new(
        app.tracker.clone(),
        Arc::new(app.store.clone()),
        app.runtimes()?,
    );
    let message_id = app
        .store
        .create_message(NewMessage::assistant_placeholder())
        .await?;

    let mut updates = app.tracker.subscribe();
    let (operation, handle) = chat.spawn(ChatRequest::new(provider, payload, &message_id))?;

    if let Some(secs) = timeout {
        let tracker = app.tracker.clone();
        let operation = operation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if tracker.cancel(&operation, "timed out") {
                warn!(operation_id = %operation, secs, "generation timed out");
            }
        });
    }

    let mut printed = 0;
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(OperationUpdate::Progress { id, .. }) if id == operation => {
                    printed = print_new_content(&app.store, &message_id, printed).await?;
                }
                Ok(OperationUpdate::Finished { id, .. }) if id == operation => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!(operation_id = %operation, "interrupted");
                chat.stop(&message_id);
            }
        }
    }

    let report = handle.await.context("generation task panicked")?;
    print_new_content(&app.store, &message_id, printed).await?;
    println!();
    match report.outcome {
        DispatchOutcome::Completed => {
            if let Some(usage) = report.usage {
                eprintln!(
                    "[{} prompt + {} completion tokens]",
                    usage.prompt_tokens, usage.completion_tokens
                );
            }
            if let Some(speed) = report.performance {
                eprintln!(
                    "[first token after {} ms, {:.1} tokens/s]",
                    speed.ttft_ms, speed.tps
                );
            }
            Ok(())
        }
        DispatchOutcome::Cancelled => {
            eprintln!("[cancelled]");
            Ok(())
        }
        DispatchOutcome::Failed(failure) => bail!("generation failed: {failure}"),
    }
}

/// Prints whatever content arrived after the first `printed` bytes.
async fn print_new_content(
    store: &InMemoryMessageStore,
    message_id: &str,
    printed: usize,
) -> Result<usize> {
    let Some(message) = store.get_message(message_id).await? else {
        return Ok(printed);
    };
    if let Some(fresh) = message.content.get(printed..) {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(fresh.as_bytes())?;
        stdout.flush()?;
    }
    Ok(message.content.len())
}

async fn translate(app: &App, to: Option<String>, text: String) -> Result<()> {
    let pipeline = app.auxiliary()?;
    let message_id = app
        .store
        .create_message(NewMessage::new(Role::User, text))
        .await?;
    let MessageTranslation {
        translation,
        source_language,
        ..
    } = pipeline.translate_message(&message_id, to.as_deref()).await?;
    match translation.outcome {
        TaskOutcome::Completed(text) => {
            if let Some(from) = source_language {
                eprintln!("[from {from}]");
            }
            println!("{text}");
            Ok(())
        }
        TaskOutcome::Cancelled => bail!("translation cancelled"),
        TaskOutcome::Failed(failure) => bail!("translation failed: {failure}"),
    }
}

async fn summarize(app: &App, language: Option<String>, text: String) -> Result<()> {
    let pipeline = app.auxiliary()?;
    let message_id = app
        .store
        .create_message(NewMessage::new(Role::User, text))
        .await?;
    let report = pipeline
        .summarize(&message_id, language.as_deref())
        .await?;
    match report.outcome {
        TaskOutcome::Completed(summary) => {
            println!("{summary}");
            Ok(())
        }
        TaskOutcome::Cancelled => bail!("summary cancelled"),
        TaskOutcome::Failed(failure) => bail!("summary failed: {failure}"),
    }
}

fn providers(app: &App) {
    for profile in app.settings.effective_profiles() {
        let credentials = match profile.resolve_api_key(app.factory.env()) {
            Ok(_) => "ready",
            Err(_) => "missing key",
        };
        println!(
            "{:<12} {:<40} {:<12} {}",
            profile.id.as_str(),
            profile.reported_endpoint(),
            format!("{:?}", profile.response_shape),
            credentials
        );
    }
}
