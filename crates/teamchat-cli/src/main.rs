use std::io::Write as _;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use teamchat_client::{Credentials, Installation, ListFilter, Session};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "teamchat", about = "Team-chat protocol client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and cache the session in `.teamchatrc`.
    Login {
        /// Installation base URL, e.g. https://digitalcrew.teamwork.com.
        #[arg(long)]
        installation: url::Url,
        /// Bare API key (uses the club-lemon login convention).
        #[arg(long, conflicts_with = "username")]
        key: Option<String>,
        /// Username, paired with --password or an interactive prompt.
        #[arg(long, requires = "password")]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Connect using the cached session and stream events to stdout.
    Connect,
    /// Send a single message to a room or a person by handle, then exit.
    Send {
        /// Room id to send to.
        #[arg(long, conflicts_with = "handle")]
        room: Option<i64>,
        /// Person handle to send to (uses/creates their pair room).
        #[arg(long)]
        handle: Option<String>,
        message: String,
    },
    /// List rooms visible to the current user.
    Rooms,
    /// List people visible to the current user.
    People,
    /// Run a minimal reply-loop bot: echoes every non-self message back.
    Bot,
    /// Forget the cached session.
    Logout,
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

/// Resolve the installation + credentials to connect with: the cached
/// `.teamchatrc` if present, overridable by `TEAMCHAT_INSTALLATION` /
/// `TEAMCHAT_AUTH` environment variables.
fn resolve_session_args() -> anyhow::Result<(Installation, Credentials)> {
    let rc = teamchat_config::discover_and_load();
    let user = rc
        .user
        .ok_or_else(|| anyhow::anyhow!("no cached session; run `teamchat login` first"))?;

    let base_url = std::env::var("TEAMCHAT_INSTALLATION")
        .ok()
        .unwrap_or(user.api.installation);
    let auth = std::env::var("TEAMCHAT_AUTH")
        .unwrap_or_else(|_| user.api.auth.expose_secret().to_string());

    let installation = Installation::new(url::Url::parse(&base_url)?);
    Ok((installation, Credentials::Token(auth)))
}

fn read_password_prompt() -> anyhow::Result<String> {
    print!("Password: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end().to_string())
}

async fn handle_login(
    installation: url::Url,
    key: Option<String>,
    username: Option<String>,
    password: Option<String>,
) -> anyhow::Result<()> {
    let installation = Installation::new(installation);
    let credentials = if let Some(key) = key {
        Credentials::ApiKey(key)
    } else if let Some(username) = username {
        let password = match password {
            Some(password) => password,
            None => read_password_prompt()?,
        };
        Credentials::UserPass { username, password }
    } else {
        anyhow::bail!("pass either --key or --username/--password");
    };

    let session = Session::connect(installation.clone(), credentials).await?;
    let token = session.auth_token().await;
    session.close().await;

    let mut rc = teamchat_config::discover_and_load();
    rc.user = Some(teamchat_config::UserBlock {
        api: teamchat_config::ApiBlock {
            installation: installation.base_url.to_string(),
            auth: secrecy::SecretString::from(token),
        },
    });
    let path = teamchat_config::find_or_default_config_path();
    teamchat_config::save(&rc, &path)?;
    println!("Logged in; session cached at {}", path.display());
    Ok(())
}

async fn handle_connect() -> anyhow::Result<()> {
    let (installation, credentials) = resolve_session_args()?;
    let session = Session::connect(installation, credentials).await?;
    let mut events = session.subscribe();

    println!("Connected. Waiting for events (Ctrl-C to exit)...");
    loop {
        match events.recv().await {
            Ok(event) => println!("{event:?}"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event receiver lagged");
            },
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

async fn handle_send(room: Option<i64>, handle: Option<String>, message: String) -> anyhow::Result<()> {
    let (installation, credentials) = resolve_session_args()?;
    let session = Session::connect(installation, credentials).await?;

    if let Some(room_id) = room {
        let room = session
            .get_room(room_id)
            .ok_or_else(|| anyhow::anyhow!("room {room_id} not in cache"))?;
        session.send_room_message(&room, &message).await?;
    } else if let Some(handle) = handle {
        let room = session.get_room_for_handles(std::slice::from_ref(&handle)).await?;
        session.send_room_message(&room, &message).await?;
    } else {
        anyhow::bail!("pass either --room or --handle");
    }

    session.close().await;
    Ok(())
}

async fn handle_rooms() -> anyhow::Result<()> {
    let (installation, credentials) = resolve_session_args()?;
    let session = Session::connect(installation, credentials).await?;
    let rooms = session.get_rooms(ListFilter::default()).await?;
    for room in &rooms {
        let title = room.title().await.unwrap_or_else(|| "(untitled)".into());
        println!("{:>8}  {}", room.id().await.unwrap_or(0), title);
    }
    session.close().await;
    Ok(())
}

async fn handle_people() -> anyhow::Result<()> {
    let (installation, credentials) = resolve_session_args()?;
    let session = Session::connect(installation, credentials).await?;
    let people = session.get_people(ListFilter::default()).await?;
    for person in &people {
        println!("{:>8}  @{}", person.id, person.handle().await);
    }
    session.close().await;
    Ok(())
}

/// A minimal reply-loop bot: echoes every message it did not send itself
/// back into the same room, prefixed with "echo: ".
async fn handle_bot() -> anyhow::Result<()> {
    let (installation, credentials) = resolve_session_args()?;
    let session = Session::connect(installation, credentials).await?;
    let mut events = session.subscribe();

    println!("Bot running. Ctrl-C to exit.");
    while let Ok(event) = events.recv().await {
        if let teamchat_client::Event::MessageReceived { room, message } = event {
            let reply = format!("echo: {}", message.body().await);
            if let Err(e) = session.send_room_message(&room, &reply).await {
                tracing::warn!(error = %e, "failed to send echo reply");
            }
        }
    }
    Ok(())
}

async fn handle_logout() -> anyhow::Result<()> {
    let path = teamchat_config::find_or_default_config_path();
    if path.exists() {
        std::fs::remove_file(&path)?;
        println!("Removed cached session at {}", path.display());
    } else {
        println!("No cached session to remove.");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);
    info!(version = env!("CARGO_PKG_VERSION"), "teamchat starting");

    match cli.command {
        Commands::Login { installation, key, username, password } => {
            handle_login(installation, key, username, password).await
        },
        Commands::Connect => handle_connect().await,
        Commands::Send { room, handle, message } => handle_send(room, handle, message).await,
        Commands::Rooms => handle_rooms().await,
        Commands::People => handle_people().await,
        Commands::Bot => handle_bot().await,
        Commands::Logout => handle_logout().await,
    }
}
