use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Input;
use loqa_rooms::console::{ChatInput, Console, InputEvent, TerminalConsole};
use loqa_rooms::{join_room, AudioDeviceFactory, ChatError, Config, NameSource, NatsTransport, SessionContext};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "loqa-rooms", version, about = "Text and voice chat rooms over NATS")]
struct Cli {
    /// Server host (prompted if omitted)
    #[arg(long)]
    host: Option<String>,

    /// Server port (prompted if omitted)
    #[arg(long)]
    port: Option<u16>,

    /// Room to join (prompted if omitted)
    #[arg(long)]
    room: Option<String>,

    /// Display name (prompted if omitted)
    #[arg(long)]
    name: Option<String>,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn prompt_required(prompt: &str) -> Result<String> {
    let value = Input::<String>::new()
        .with_prompt(prompt)
        .validate_with(|input: &String| -> Result<(), &'static str> {
            if input.trim().is_empty() {
                Err("must not be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()?;
    Ok(value.trim().to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// First name from the command line or a prompt, later ones typed at the chat prompt
struct PromptedNames {
    first: Option<String>,
    console: Arc<dyn Console>,
}

#[async_trait::async_trait]
impl NameSource for PromptedNames {
    async fn next_name(
        &mut self,
        rejection: Option<&str>,
        input: &mut mpsc::Receiver<InputEvent>,
    ) -> Result<String, ChatError> {
        if let Some(name) = self.first.take() {
            return Ok(name);
        }

        match rejection {
            Some(reason) => self.console.notice(&format!("{}. Type another name:", reason)),
            None => self.console.notice("Type your name:"),
        }

        while let Some(event) = input.recv().await {
            match event {
                InputEvent::Line(line) if !line.trim().is_empty() => return Ok(line.trim().to_string()),
                InputEvent::Line(_) => self.console.notice("Name must not be empty."),
                InputEvent::Eof | InputEvent::Interrupted => break,
            }
        }
        Err(ChatError::JoinAborted("no name given".to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut cfg = Config::load().context("Failed to load configuration")?;

    cfg.server.host = match non_empty(cli.host) {
        Some(host) => host,
        None => Input::<String>::new()
            .with_prompt("Server address")
            .default(cfg.server.host.clone())
            .interact_text()?,
    };
    cfg.server.port = match cli.port {
        Some(port) => port,
        None => Input::<u16>::new()
            .with_prompt("Port")
            .default(cfg.server.port)
            .interact_text()?,
    };
    let room = match non_empty(cli.room) {
        Some(room) => room,
        None => prompt_required("Room id")?,
    };
    let name = match non_empty(cli.name) {
        Some(name) => name,
        None => prompt_required("Your name")?,
    };

    info!("loqa-rooms v{}", env!("CARGO_PKG_VERSION"));

    let transport = NatsTransport::connect(&cfg.server.url(), cfg.server.service.clone())
        .await
        .with_context(|| format!("Failed to connect to {}", cfg.server.url()))?;

    let (mut chat_input, writer) = ChatInput::new("> ".to_string()).context("Failed to open terminal")?;
    let console: Arc<dyn Console> = Arc::new(TerminalConsole::new(writer));

    let ctx = SessionContext {
        transport: Arc::new(transport),
        device: AudioDeviceFactory::create(),
        console: console.clone(),
        format: cfg.audio.format(),
        config: cfg.session.clone(),
        transfer: cfg.transfer.clone(),
    };

    // One input channel: name prompts borrow it, the accepted session keeps it
    let (line_tx, line_rx) = mpsc::channel(64);

    let session = {
        let console = console.clone();
        async move {
            let mut names = PromptedNames {
                first: Some(name),
                console: console.clone(),
            };
            let session = join_room(&ctx, &room, &mut names, line_rx).await?;

            console.notice(&format!(
                "Joined room {} as {}. Type /help for commands.",
                room,
                session.identity().sender()
            ));
            session.run().await
        }
    };

    let pump = async {
        loop {
            let event = chat_input.read_line().await;
            let last = matches!(event, InputEvent::Eof | InputEvent::Interrupted);
            if line_tx.send(event).await.is_err() || last {
                break;
            }
        }
    };

    tokio::pin!(session);
    let finished = tokio::select! {
        result = &mut session => Some(result),
        _ = pump => None,
    };
    let result = match finished {
        Some(result) => result,
        None => session.await,
    };

    // Leaves raw mode before anything else reaches the terminal
    drop(chat_input);

    result.context("Chat session failed")?;
    info!("Bye");
    Ok(())
}
