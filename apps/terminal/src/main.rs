use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, ChatController, ChatEvent, MediaUpload};
use shared::domain::{ConversationId, MessageId, PresenceFact, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `api_base_url` from settings.
    #[arg(long)]
    api_url: Option<String>,
    /// Overrides `socket_url` from settings.
    #[arg(long)]
    socket_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
}

const HELP: &str = "commands: /list  /open <id>  /history  /read  /edit <message-id> <text>  \
/delete <message-id>  /attach <path> [caption]  /quit  (anything else is sent)";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_base_url = api_url;
    }
    if let Some(socket_url) = args.socket_url {
        settings.socket_url = socket_url;
    }

    let controller = ChatController::new(settings);
    let events = BroadcastStream::new(controller.subscribe_events());
    tokio::spawn(print_events(events));

    if let Err(err) = controller
        .mount(args.token.as_deref(), args.user_id.map(UserId::new))
        .await
    {
        warn!("initial load failed: {err}");
    }
    print_conversations(&controller);
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = run_command(&controller, line).await {
            println!("! {err}");
        }
    }

    controller.unmount();
    Ok(())
}

async fn run_command(controller: &ChatController, line: &str) -> Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "/help" => println!("{HELP}"),
        "/list" => print_conversations(controller),
        "/history" => print_timeline(controller),
        "/open" => {
            controller
                .select_conversation(&ConversationId::from(rest.trim()))
                .await?;
            print_timeline(controller);
        }
        "/read" => {
            let conversation_id = controller.selected().context("no conversation is open")?;
            controller.mark_as_read(&conversation_id).await?;
        }
        "/edit" => {
            let (message_id, text) = rest
                .split_once(' ')
                .context("usage: /edit <message-id> <text>")?;
            controller
                .edit_message(&MessageId::from(message_id), text)
                .await?;
        }
        "/delete" => {
            controller
                .delete_message(&MessageId::from(rest.trim()))
                .await?;
        }
        "/attach" => {
            let (path, caption) = rest.split_once(' ').unwrap_or((rest, ""));
            controller.attach_media(read_upload(Path::new(path)).await?)?;
            let caption = Some(caption.to_string()).filter(|c| !c.trim().is_empty());
            let message = controller.send_media(caption).await?;
            println!("uploaded {}", message.id);
        }
        _ if command.starts_with('/') => println!("{HELP}"),
        _ => {
            controller.keystroke(line);
            controller.send_message()?;
        }
    }
    Ok(())
}

async fn read_upload(path: &Path) -> Result<MediaUpload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("attachment.bin")
        .to_string();
    let mime_type = mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string();
    Ok(MediaUpload {
        filename,
        mime_type,
        bytes,
    })
}

async fn print_events(mut events: BroadcastStream<ChatEvent>) {
    while let Some(event) = events.next().await {
        match event {
            Ok(ChatEvent::Notice(text)) => println!("! {text}"),
            Ok(ChatEvent::Presence(PresenceFact::Online(user_id))) => println!("* {user_id} is online"),
            Ok(ChatEvent::Presence(PresenceFact::Offline(user_id))) => println!("* {user_id} went offline"),
            Ok(ChatEvent::Presence(PresenceFact::Snapshot(user_ids))) => {
                println!("* {} users online", user_ids.len())
            }
            Ok(ChatEvent::Typing(signal)) => {
                println!("* {} is typing in {}", signal.user_id, signal.conversation_id)
            }
            Ok(ChatEvent::TimelineChanged { .. } | ChatEvent::ConversationsChanged) => {}
            Err(err) => warn!("event stream lagged: {err}"),
        }
    }
}

fn print_conversations(controller: &ChatController) {
    let selected = controller.selected();
    for conversation in controller.conversations() {
        let marker = if selected.as_ref() == Some(&conversation.id) { ">" } else { " " };
        let preview = conversation
            .last_message
            .as_ref()
            .and_then(|preview| preview.content.as_deref())
            .unwrap_or("");
        println!(
            "{marker} {} ({} unread) {preview}",
            conversation.id, conversation.unread_count
        );
    }
}

fn print_timeline(controller: &ChatController) {
    for message in controller.timeline() {
        let edited = if message.is_edited && !message.is_deleted { " (edited)" } else { "" };
        let media = message
            .media
            .as_ref()
            .map(|media| format!(" [{}]", media.url))
            .unwrap_or_default();
        println!(
            "{} {} {}: {}{media}{edited}",
            message.created_at.format("%H:%M"),
            message.id,
            message.sender.display_name(),
            message.display_body()
        );
    }
}
