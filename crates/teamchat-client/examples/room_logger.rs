//! Connects and prints every event to stdout, tagged with its room
//! title where applicable. Useful for watching the cache and event
//! router react to live traffic.
//!
//! Run with:
//!   TEAMCHAT_INSTALLATION=https://digitalcrew.teamwork.com \
//!   TEAMCHAT_AUTH=<tw-auth cookie value> \
//!   cargo run -p teamchat-client --example room_logger

use teamchat_client::{Credentials, Event, Installation, Session};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let base_url = std::env::var("TEAMCHAT_INSTALLATION")?;
    let auth = std::env::var("TEAMCHAT_AUTH")?;
    let installation = Installation::new(url::Url::parse(&base_url)?);

    let session = Session::connect(installation, Credentials::Token(auth)).await?;
    let mut events = session.subscribe();

    while let Ok(event) = events.recv().await {
        match event {
            Event::Message { room, message } | Event::MessageReceived { room, message } => {
                let title = room.title().await.unwrap_or_else(|| "(untitled)".into());
                println!("[{title}] {}", message.body().await);
            },
            Event::Connected => println!("-- connected --"),
            Event::Disconnect => println!("-- disconnected --"),
            Event::Reconnect { downtime } => println!("-- reconnected after {downtime:?} --"),
            other => println!("{other:?}"),
        }
    }

    Ok(())
}
