use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, ChatClient, ClientHandle, ConversationEvent, NoticeLevel, SelectOutcome,
};
use shared::{domain::UserId, protocol::Message};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal front end for the chat backend")]
struct Cli {
    /// Overrides the configured API base URL.
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        email: String,
        password: String,
    },
    Signup {
        full_name: String,
        email: String,
        password: String,
    },
    Logout,
    Whoami,
    Avatar {
        avatar_ref: String,
    },
    ForgotPassword {
        email: String,
    },
    ResetPassword {
        token: String,
        password: String,
    },
    Roster {
        #[arg(long)]
        online: bool,
    },
    Send {
        peer_id: String,
        text: Option<String>,
        #[arg(long)]
        image: Option<String>,
    },
    /// Prints live messages for a peer (or the last selected one) until Ctrl-C.
    Listen {
        peer_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(api_url) = cli.api_url {
        settings.api_base_url = client_core::config::normalize_api_base_url(&api_url);
    }
    let client = ChatClient::new(settings)?;
    client.start();
    print_notices(&client);

    match cli.command {
        Command::Login { email, password } => {
            let identity = client.login(&email, &password).await?;
            println!("logged in as {} <{}>", identity.display_name, identity.email);
        }
        Command::Signup {
            full_name,
            email,
            password,
        } => {
            let identity = client.signup(&full_name, &email, &password).await?;
            println!("created account {} ({})", identity.display_name, identity.id);
        }
        Command::Logout => {
            client.resolve_session().await;
            client.logout().await;
        }
        Command::Whoami => match client.resolve_session().await {
            Some(identity) => println!(
                "{} <{}> id={} realtime={}",
                identity.display_name,
                identity.email,
                identity.id,
                client.connection_state()
            ),
            None => println!("signed out"),
        },
        Command::Avatar { avatar_ref } => {
            require_session(&client).await?;
            let identity = client.update_profile(&avatar_ref).await?;
            println!(
                "avatar set to {}",
                identity.avatar_ref.as_deref().unwrap_or("-")
            );
        }
        Command::ForgotPassword { email } => {
            if !client.forgot_password(&email).await {
                bail!("reset email was not sent");
            }
        }
        Command::ResetPassword { token, password } => {
            if !client.reset_password(&token, &password).await {
                bail!("password was not reset");
            }
        }
        Command::Roster { online } => {
            require_session(&client).await?;
            let selected = client.conversations().active_peer();
            for peer in client.list_peers(online).await? {
                let marker = if selected.as_ref() == Some(&peer.id) { '*' } else { ' ' };
                let presence = if peer.is_online { "online" } else { "offline" };
                println!(
                    "{marker} {:<26} {:<8} {}",
                    peer.id.as_str(),
                    presence,
                    peer.display_name
                );
            }
        }
        Command::Send {
            peer_id,
            text,
            image,
        } => {
            require_session(&client).await?;
            client.select_peer(&UserId::new(peer_id)).await?;
            let message = client
                .send_message(text.as_deref(), image.as_deref())
                .await?;
            print_message(&message);
        }
        Command::Listen { peer_id } => {
            require_session(&client).await?;
            listen(&client, peer_id.map(UserId::new)).await?;
        }
    }

    Ok(())
}

async fn require_session(client: &Arc<ChatClient>) -> Result<()> {
    if client.resolve_session().await.is_none() {
        bail!("not signed in; run `desktop login <email> <password>` first");
    }
    Ok(())
}

fn print_notices(client: &Arc<ChatClient>) {
    let mut notices = BroadcastStream::new(client.notices().subscribe());
    tokio::spawn(async move {
        while let Some(notice) = notices.next().await {
            let Ok(notice) = notice else { continue };
            let tag = match notice.level {
                NoticeLevel::Success => "ok",
                NoticeLevel::Warning => "warn",
                NoticeLevel::Error => "error",
            };
            eprintln!("[{tag}] {}", notice.text);
        }
    });
}

fn print_message(message: &Message) {
    let body = match (&message.text, &message.image_ref) {
        (Some(text), Some(image)) => format!("{text} [image: {image}]"),
        (Some(text), None) => text.clone(),
        (None, Some(image)) => format!("[image: {image}]"),
        (None, None) => String::new(),
    };
    println!(
        "{} {} -> {}: {}",
        message.created_at.format("%H:%M:%S"),
        message.sender_id,
        message.receiver_id,
        body
    );
}

async fn listen(client: &Arc<ChatClient>, peer_id: Option<UserId>) -> Result<()> {
    let mut events = BroadcastStream::new(client.conversations().subscribe());

    let peers = client.list_peers(false).await?;
    let peer_id = match peer_id.or_else(|| client.conversations().active_peer()) {
        Some(peer_id) => peer_id,
        None => bail!("no peer given and no previous selection to restore"),
    };
    if client.conversations().active_peer().as_ref() != Some(&peer_id) {
        let outcome = client.select_peer(&peer_id).await?;
        if outcome == SelectOutcome::Offline {
            eprintln!("realtime offline; waiting for the transport");
        }
    }
    let name = peers
        .iter()
        .find(|peer| peer.id == peer_id)
        .map(|peer| peer.display_name.clone())
        .unwrap_or_else(|| peer_id.to_string());
    for message in client.conversations().messages() {
        print_message(&message);
    }
    eprintln!("listening for {name}; Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.next() => match event {
                Some(Ok(ConversationEvent::MessageAppended(message))) => print_message(&message),
                Some(Ok(ConversationEvent::SelectionChanged(None))) => {
                    eprintln!("session ended");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => tracing::warn!("desktop: missed conversation events: {err}"),
                None => break,
            },
        }
    }
    Ok(())
}
