use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use murmur::client::{Client, ClientError, ConnectionState, KnownHosts};
use murmur::config::{ClientConfig, FileConfig, MurmurConfig, ServerConfig, load_config};
use murmur::server::Server;
use murmur::server::channels::encode_update_store;
use murmur::server::listener;
use murmur::server::store::write_atomic;
use murmur_proto::channels::{CHAT, UPDATE};
use murmur_proto::message::{Chat, Update};
use murmur_proto::{Message, ServerKey};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "murmur")]
#[command(about = "Multi-channel realtime messaging server and client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.murmur)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Serve(ServeArgs),

    /// Join a server as a line-oriented chat client
    Connect(ConnectArgs),

    /// Print this server's key fingerprint
    Fingerprint,

    /// Stage a client build for the update channel (read on next boot)
    PublishUpdate(PublishUpdateArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct ConnectArgs {
    /// Server URL (tcp://host:port or ws://host:port/ws)
    #[arg(long)]
    server: Option<String>,

    /// Display name
    #[arg(long)]
    name: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct PublishUpdateArgs {
    /// Version string clients compare against their own
    version: String,

    /// Build to distribute
    file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dirs = MurmurConfig::new(cli.data_dir.clone())?;
    let file_config: FileConfig = load_config(&dirs.data_dir)
        .extract()
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve(args) => run_server(args, dirs, file_config).await,
        Commands::Connect(args) => run_client(args, dirs, file_config).await,
        Commands::Fingerprint => {
            let key = dirs.load_or_create_server_key()?;
            println!("{}", key.public_key().fingerprint());
            Ok(())
        }
        Commands::PublishUpdate(args) => publish_update(args, dirs, file_config).await,
    }
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "murmur=debug,murmur_proto=debug,info"
    } else {
        "murmur=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

async fn run_server(args: ServeArgs, dirs: MurmurConfig, file_config: FileConfig) -> Result<()> {
    init_logging(args.debug);
    info!("Starting murmur server");

    let key: ServerKey = dirs.load_or_create_server_key()?;
    let config = ServerConfig::from_file(&file_config.server, &dirs);
    let server = Arc::new(Server::new(config.clone(), key));
    info!("Server fingerprint: {}", server.fingerprint());

    server.load().await;
    let persistence = server.start_persistence();

    let tcp = tokio::net::TcpListener::bind((config.host.as_str(), config.tcp_port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.tcp_port))?;
    let ws = match config.ws_port {
        Some(port) => Some(
            tokio::net::TcpListener::bind((config.host.as_str(), port))
                .await
                .with_context(|| format!("Failed to bind {}:{}", config.host, port))?,
        ),
        None => None,
    };

    let tcp_task = listener::serve_tcp(Arc::clone(&server), tcp);
    let ws_task = {
        let server = Arc::clone(&server);
        async move {
            match ws {
                Some(ws) => listener::serve_ws(server, ws).await,
                None => std::future::pending().await,
            }
        }
    };

    let result = tokio::select! {
        res = tcp_task => res,
        res = ws_task => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, cleaning up...");
            Ok(())
        }
    };

    persistence.abort();
    info!("Saving channel state...");
    let saved = server.save_all().await;
    info!("Saved {} channels", saved);
    info!("Shutdown complete");
    result
}

async fn run_client(args: ConnectArgs, dirs: MurmurConfig, file_config: FileConfig) -> Result<()> {
    init_logging(args.debug);

    let mut client_file = file_config.client;
    if let Some(server) = args.server {
        client_file.server = server;
    }
    if let Some(name) = args.name {
        client_file.name = Some(name);
    }
    let config = ClientConfig::from_file(&client_file)?;
    let known_hosts = KnownHosts::load(&dirs.known_hosts_path)?;

    let (client, handle) = Client::new(config, known_hosts);
    let mut client_task = tokio::spawn(client.run());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = handle.state();
    let mut handle = handle;
    loop {
        tokio::select! {
            Ok(()) = state.changed() => {
                let label = state_label(*state.borrow_and_update());
                eprintln!("-- {label}");
            }
            line = lines.next_line() => match line? {
                Some(line) if !line.trim().is_empty() => {
                    let chat = Chat { from: String::new(), text: line, sent_at_ms: 0 };
                    if !handle.send(CHAT, chat).await {
                        break;
                    }
                }
                Some(_) => {}
                None => break,
            },
            incoming = handle.recv() => match incoming {
                Some(incoming) => print_incoming(&incoming.channel, &incoming.message),
                None => break,
            },
            res = &mut client_task => {
                return report_exit(res.context("client task panicked")?);
            }
        }
    }

    handle.stop();
    report_exit(client_task.await.context("client task panicked")?)
}

fn report_exit(res: Result<(), ClientError>) -> Result<()> {
    match res {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(code = e.code(), "client stopped");
            bail!(e)
        }
    }
}

fn print_incoming(channel: &str, message: &Message) {
    match message {
        Message::Chat(chat) => println!("[{channel}] <{}> {}", chat.from, chat.text),
        Message::UserList(list) => {
            let names: Vec<&str> = list.users.iter().map(|u| u.name.as_str()).collect();
            println!("[{channel}] online: {}", names.join(", "));
        }
        Message::Typing(t) if t.active => println!("[{channel}] {} is typing...", t.name),
        Message::FileUpload(up) => {
            println!("[{channel}] {} shared {} ({} bytes)", up.from, up.file_name, up.body.len())
        }
        Message::Update(update) => println!("[{channel}] update {} available", update.version),
        Message::MusicState(m) => println!(
            "[{channel}] {} {} {} @ {}ms",
            m.node,
            if m.playing { "playing" } else { "paused" },
            m.song,
            m.position_ms
        ),
        Message::StatusNotice(n) => println!("[{channel}] {:?}: {}", n.status, n.detail),
        _ => {}
    }
}

fn state_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "offline",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Handshaking => "handshaking",
        ConnectionState::Identifying => "identifying",
        ConnectionState::Active => "online",
    }
}

async fn publish_update(args: PublishUpdateArgs, dirs: MurmurConfig, file_config: FileConfig) -> Result<()> {
    let body = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let config = ServerConfig::from_file(&file_config.server, &dirs);
    let path = config.store_path(UPDATE);
    let update = Update {
        version: args.version,
        body: body.into(),
    };
    write_atomic(&path, &encode_update_store(&update)).await?;
    println!(
        "Staged update {} ({} bytes) at {}",
        update.version,
        update.body.len(),
        path.display()
    );
    Ok(())
}
