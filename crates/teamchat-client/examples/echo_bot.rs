//! Connects with credentials taken from the environment, then echoes
//! every message it receives back into the same room.
//!
//! Run with:
//!   TEAMCHAT_INSTALLATION=https://digitalcrew.teamwork.com \
//!   TEAMCHAT_AUTH=<tw-auth cookie value> \
//!   cargo run -p teamchat-client --example echo_bot

use teamchat_client::{Credentials, Event, Installation, Session};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let base_url = std::env::var("TEAMCHAT_INSTALLATION")?;
    let auth = std::env::var("TEAMCHAT_AUTH")?;
    let installation = Installation::new(url::Url::parse(&base_url)?);

    let session = Session::connect(installation, Credentials::Token(auth)).await?;
    let mut events = session.subscribe();

    println!("echo_bot connected, listening for messages...");
    while let Ok(event) = events.recv().await {
        if let Event::MessageReceived { room, message } = event {
            let body = message.body().await;
            session.send_room_message(&room, &format!("echo: {body}")).await?;
        }
    }

    Ok(())
}
