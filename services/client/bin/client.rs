//! Main Entrypoint for the PaCo Terminal Client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Showing the disclaimer and signing the participant in.
//! 3. Wiring the connection manager, voice coordinator, and chat runtime.
//! 4. Relaying typed lines and commands to the runtime and printing its notices.

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use paco_client::{
    audio::{ClipFileOutput, UnsupportedRecognizer},
    config::Config,
    http::HttpPacoApi,
    onboarding::{self, DISCLAIMER, SignedIn},
    runtime::{ChatRuntime, Notice, RuntimeOptions, RuntimeParts, event_channel},
};
use paco_core::{message::Role, voice::VoiceCoordinator};
use paco_realtime::{ConnectionConfig, ConnectionManager};
use std::{io::Write, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Chat with PaCo from the terminal")]
struct Cli {
    /// Research ID to sign in with. Prompts when omitted.
    #[arg(long)]
    research_id: Option<String>,

    /// Never start voice calls.
    #[arg(long)]
    text_only: bool,
}

type Input = Lines<BufReader<Stdin>>;

fn prompt(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

/// Reads one trimmed line. `None` on end of input.
async fn read_line(input: &mut Input) -> anyhow::Result<Option<String>> {
    let line = input.next_line().await.context("Failed to read from stdin")?;
    Ok(line.map(|line| line.trim().to_string()))
}

/// Loops until the participant is signed in or input runs out.
async fn sign_in(
    api: &HttpPacoApi,
    mut research_id: Option<String>,
    input: &mut Input,
) -> anyhow::Result<Option<SignedIn>> {
    println!("{}\n", DISCLAIMER);
    loop {
        prompt("Type 'yes' to acknowledge the disclaimer: ");
        match read_line(input).await? {
            None => return Ok(None),
            Some(answer) if answer.eq_ignore_ascii_case("yes") => break,
            Some(_) => println!("You must acknowledge the disclaimer to continue."),
        }
    }

    loop {
        let id = match research_id.take() {
            Some(id) => id,
            None => {
                prompt("Research ID: ");
                match read_line(input).await? {
                    Some(id) => id,
                    None => return Ok(None),
                }
            }
        };
        match onboarding::sign_in(api, &id).await {
            Ok(signed_in) => return Ok(Some(signed_in)),
            Err(e) => {
                warn!(error = %e, "Sign-in failed.");
                println!("Sign-in failed: {}. Please try again.", e);
            }
        }
    }
}

fn print_notice(notice: Notice) {
    match notice {
        Notice::Connected => println!("[connected]"),
        Notice::Disconnected => println!("[disconnected, reconnecting]"),
        Notice::ConnectionError(e) => info!(error = %e, "Connection error."),
        Notice::History(messages) => {
            for message in messages {
                let who = match message.role {
                    Role::User => "you",
                    Role::Assistant => "paco",
                    Role::System => "system",
                };
                println!("{}> {}", who, message.content);
            }
        }
        Notice::Sent(_) => println!("[paco is typing...]"),
        Notice::NotSent(_) => println!("[not connected: message not sent]"),
        Notice::Rejected(e) => println!("[{}]", e),
        Notice::Partial(_) => {}
        Notice::Reply(message) => println!("paco> {}", message.content),
        Notice::UpstreamError(e) => println!("[error: {}]", e),
        Notice::CallStarted => println!("[call started]"),
        Notice::CallUnavailable(reason) => println!("[cannot start call: {}]", reason),
        Notice::CallWarning { remaining } => {
            println!("[call ends in {} seconds]", remaining.as_secs())
        }
        Notice::CallEnded(reason) => println!("[call ended: {:?}]", reason),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(api_url = %config.api_url, ws_url = %config.ws_url, "Configuration loaded.");

    // --- 3. Sign In ---
    let api = Arc::new(HttpPacoApi::new(&config.api_url).context("Failed to build HTTP client")?);
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let Some(signed_in) = sign_in(&api, cli.research_id.clone(), &mut input).await? else {
        info!("Input closed before sign-in.");
        return Ok(());
    };
    if signed_in.token.is_expired(Utc::now()) {
        warn!(expires_at = %signed_in.token.expires_at, "Access token is already expired.");
    }

    // --- 4. Wire the Runtime ---
    let (handle, events) = event_channel();
    let voice = VoiceCoordinator::new(
        Box::new(UnsupportedRecognizer),
        Box::new(ClipFileOutput::new(config.audio_out_dir.clone(), handle.clone())),
        config.call_limits(),
    );
    let connection = ConnectionManager::websocket(ConnectionConfig {
        url: config.ws_url.clone(),
        reconnect_delay: config.reconnect_delay,
    });
    let (runtime, mut notices) = ChatRuntime::new(RuntimeParts {
        credentials: signed_in.credentials,
        api,
        connection,
        voice,
        options: RuntimeOptions {
            model: config.chat_model.clone(),
            history_limit: config.history_limit,
            mirror_transcripts: config.mirror_transcripts,
        },
        handle: handle.clone(),
        events,
    });
    info!(conversation_id = %runtime.conversation_id(), "Starting chat.");
    let runtime_task = tokio::spawn(runtime.run());
    let printer = tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            print_notice(notice);
        }
    });

    println!("Type a message and press Enter. Commands: /call, /hangup, /quit");

    // --- 5. Relay Input ---
    loop {
        tokio::select! {
            line = read_line(&mut input) => {
                let Some(line) = line? else { break };
                match line.as_str() {
                    "/quit" => break,
                    "/call" if cli.text_only => println!("[calls are disabled with --text-only]"),
                    "/call" => { handle.start_call(); }
                    "/hangup" => { handle.end_call(); }
                    _ => { handle.send_text(line); }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt. Shutting down...");
                break;
            }
        }
    }

    handle.shutdown();
    runtime_task.await.context("Chat runtime panicked")?;
    printer.abort();
    info!("Client has shut down.");
    Ok(())
}
