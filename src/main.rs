//! hermod server binary
//!
//! Usage:
//!   hermod serve --config hermod.json
//!   hermod serve --bind 0.0.0.0:9001 --advertise 10.0.0.1:9001 --redis-url redis://127.0.0.1/
//!   hermod token --secret s3cret --user alice
//!   hermod send --server 127.0.0.1:9001 --token <TOKEN> --to bob --text hi

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hermod::config::{AckMode, DiscoveryKind, ServerConfig};
use hermod::protocol::{Chat, ChatBody, ChatType};
use hermod::{
    ClientConfig, ClientEvent, Message, Method, Payload, RelayClient, Server,
    SignedTokenAuthenticator, current_timestamp, discovery,
};

#[derive(Parser)]
#[command(name = "hermod", version, about = "Cluster-wide real-time message delivery")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a delivery server
    Serve(ServeArgs),
    /// Mint a signed token for a user
    Token {
        #[arg(long, env = "HERMOD_AUTH_SECRET")]
        secret: String,
        #[arg(long)]
        user: String,
    },
    /// Connect as a user and send one chat message
    Send {
        #[arg(long)]
        server: SocketAddr,
        #[arg(long, env = "HERMOD_TOKEN")]
        token: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        text: String,
        /// Seconds to keep printing incoming frames after sending
        #[arg(long, default_value_t = 2)]
        wait: u64,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// JSON configuration file
    #[arg(long, env = "HERMOD_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "HERMOD_BIND")]
    bind: Option<SocketAddr>,
    /// Address peers use to reach this process
    #[arg(long, env = "HERMOD_ADVERTISE")]
    advertise: Option<String>,
    /// Use redis discovery at this url
    #[arg(long, env = "HERMOD_REDIS_URL")]
    redis_url: Option<String>,
    #[arg(long, env = "HERMOD_NAMESPACE")]
    namespace: Option<String>,
    #[arg(long, env = "HERMOD_AUTH_SECRET")]
    auth_secret: Option<String>,
    #[arg(long, env = "HERMOD_SERVICE_TOKEN")]
    service_token: Option<String>,
    /// none, only or rigor
    #[arg(long, env = "HERMOD_ACK_MODE")]
    ack_mode: Option<AckMode>,
    #[arg(long)]
    max_connections: Option<usize>,
}

impl ServeArgs {
    fn into_config(self) -> hermod::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(advertise) = self.advertise {
            config.advertise_addr = Some(advertise);
        }
        if let Some(url) = self.redis_url {
            config.discovery.kind = DiscoveryKind::Redis;
            config.discovery.redis_url = url;
        }
        if let Some(namespace) = self.namespace {
            config.discovery.namespace = namespace;
        }
        if let Some(secret) = self.auth_secret {
            config.auth_secret = Some(secret);
        }
        if let Some(token) = self.service_token {
            config.peer.service_token = token;
        }
        if let Some(ack_mode) = self.ack_mode {
            config.ack_mode = ack_mode;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args.into_config()?).await?,
        Command::Token { secret, user } => {
            println!("{}", SignedTokenAuthenticator::new(secret).issue(&user));
        }
        Command::Send {
            server,
            token,
            to,
            text,
            wait,
        } => send(server, token, to, text, wait).await?,
    }

    Ok(())
}

async fn serve(config: ServerConfig) -> hermod::Result<()> {
    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Max connections: {}", config.max_connections);
    info!("  - Ack mode: {:?}", config.ack_mode);
    info!("  - Discovery: {:?}", config.discovery.kind);

    let discovery = discovery::from_config(&config.discovery, &config.peer).await?;
    let server = Arc::new(Server::builder(config).discovery(discovery).bind().await?);

    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| hermod::RelayError::internal(format!("Signal handler failed: {}", e)))?;
    info!("Interrupt received");

    server.stop().await;
    match runner.await {
        Ok(result) => result,
        Err(e) => {
            error!("Accept loop panicked: {}", e);
            Ok(())
        }
    }
}

async fn send(
    server: SocketAddr,
    token: String,
    to: String,
    text: String,
    wait: u64,
) -> hermod::Result<()> {
    let (client, mut events) =
        RelayClient::connect(ClientConfig::with_token(server, token)).await?;
    let me = client.user_id().to_string();

    let chat = Message::data(
        Method::ConversationChat,
        me.clone(),
        Payload::Chat(Chat {
            conversation_id: format!("{}_{}", me, to),
            chat_type: ChatType::Single,
            send_id: me,
            recv_id: to,
            msg: ChatBody {
                m_type: 0,
                content: text,
            },
            send_time: current_timestamp(),
        }),
    );
    client.send(&chat).await?;
    println!("sent {}", chat.id);

    let deadline = tokio::time::sleep(Duration::from_secs(wait));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(ClientEvent::Message(msg)) => {
                    println!("{}", String::from_utf8_lossy(&msg.to_json()?));
                }
                Some(ClientEvent::Disconnected(reason)) => {
                    println!("disconnected: {}", reason);
                    break;
                }
                None => break,
            },
        }
    }

    client.close("done").await;
    Ok(())
}
