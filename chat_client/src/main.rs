use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use chat_client::config::{Cli, ProbeConfig};
use chat_client::ChatClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = ProbeConfig::load(&cli)?;
    let level = if cfg.logging_enabled {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let client = ChatClient::new(cfg.client.clone())?;
    client.start_notifications().await?;
    let mut feed = client.subscribe_feed();
    tokio::spawn(async move {
        while let Ok(event) = feed.recv().await {
            info!("notification [{:?}] {}", event.severity, event.message);
        }
    });

    match client.conversations().await {
        Ok(list) => {
            for conversation in &list {
                info!(
                    "conversation {} (unread {})",
                    conversation.id, conversation.unread_count
                );
            }
        }
        Err(err) => warn!("listing conversations failed: {err:#}"),
    }

    if let Some(id) = cfg.conversation {
        let handle = client.open_conversation(id).await?;
        info!("opened conversation {id}");
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let snap = handle.snapshot();
                    info!(
                        "state={:?} messages={} typing={}",
                        snap.connection,
                        snap.messages.len(),
                        snap.typing.len()
                    );
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    } else {
        info!("no conversation selected - watching notifications, press Ctrl+C to exit");
        tokio::signal::ctrl_c().await?;
    }
    client.shutdown().await;
    Ok(())
}
