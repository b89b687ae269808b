use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use dsi_session::protocol::command_table::{CommandHandler, CommandRegistry, CommandResult, SessionEffect};
use dsi_session::protocol::frame::{DsiCommand, Frame};
use dsi_session::protocol::result_codes::{ERR_MISC, NO_ERR};
use dsi_session::protocol::transport::{StreamTransport, Transport};
use dsi_session::session::dispatcher::SessionEngine;
use dsi_session::session::handoff::{HandoffDirectory, SessionToken};
use dsi_session::session::session_config::SessionConfig;
use dsi_session::session::session_events::SessionEventNotifier;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, Level};

/// A session server with a toy command set: login (18), logout (19) and echo (20).
///
/// A connection starts with an OpenSession request. Its reply carries the new session's token
///  as 8 bytes big endian. A client whose connection broke opens a new connection, sending the
///  token as the OpenSession payload, and continues the existing session.
#[derive(Parser)]
struct Args {
    address: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

type DemoTransport = StreamTransport<TcpStream>;

struct Login;
#[async_trait]
impl CommandHandler for Login {
    fn opcode(&self) -> u8 {
        18
    }

    async fn handle(&self, _payload: Bytes) -> CommandResult {
        CommandResult::new(NO_ERR, Bytes::new())
            .with_effect(SessionEffect::Authenticated)
    }
}

struct Logout;
#[async_trait]
impl CommandHandler for Logout {
    fn opcode(&self) -> u8 {
        19
    }

    async fn handle(&self, _payload: Bytes) -> CommandResult {
        CommandResult::new(NO_ERR, Bytes::new())
            .with_effect(SessionEffect::LoggedOut)
    }
}

struct Echo;
#[async_trait]
impl CommandHandler for Echo {
    fn opcode(&self) -> u8 {
        20
    }

    async fn handle(&self, payload: Bytes) -> CommandResult {
        CommandResult::new(NO_ERR, payload.slice(1..))
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = Arc::new(SessionConfig::new());
    config.validate()?;

    let mut registry = CommandRegistry::new();
    registry.register(Arc::new(Login))?;
    registry.register(Arc::new(Logout))?;
    registry.register(Arc::new(Echo))?;
    let commands = Arc::new(registry);

    let notifier = Arc::new(SessionEventNotifier::new());
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("session event: {:?}", event);
        }
    });

    let directory = Arc::new(HandoffDirectory::new());

    let addr: SocketAddr = args.address.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let config = config.clone();
        let commands = commands.clone();
        let notifier = notifier.clone();
        let directory = directory.clone();

        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, peer_addr, config, commands, notifier, directory).await {
                error!("connection from {}: {:#}", peer_addr, e);
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<SessionConfig>,
    commands: Arc<CommandRegistry>,
    notifier: Arc<SessionEventNotifier>,
    directory: Arc<HandoffDirectory<DemoTransport>>,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let mut transport = StreamTransport::new(stream, config.max_payload_len, peer_addr.to_string());

    let open = match transport.receive_frame().await? {
        Some(frame) => frame,
        None => return Ok(()),
    };
    if open.is_reply() || open.command != u8::from(DsiCommand::OpenSession) {
        transport.send_frame(&Frame::reply_to(open.command, open.request_id, ERR_MISC, Bytes::new())).await?;
        transport.close().await;
        bail!("expected OpenSession, received {:?}", open);
    }

    if open.payload.len() == 8 {
        let token = SessionToken::from_raw(u64::from_be_bytes(<[u8; 8]>::try_from(&open.payload[..])?));
        match directory.hand_off(token, open.request_id, transport).await {
            Ok(()) => return Ok(()),
            Err(returned) => {
                info!("{} asked to reconnect to unknown session {:?} - opening a new session", peer_addr, token);
                transport = returned;
            }
        }
    }

    let token = SessionToken::new_random();
    let token_bytes = Bytes::copy_from_slice(&token.to_raw().to_be_bytes());
    transport.send_frame(&Frame::reply_to(open.command, open.request_id, NO_ERR, token_bytes)).await?;

    let (engine, handle) = SessionEngine::new(config, token, transport, commands, notifier)?;
    directory.register(handle).await?;

    let reason = engine.run().await;
    info!("session {:?} from {} ended: {:?}", token, peer_addr, reason);

    // a failed handoff may have removed the entry already
    if let Err(e) = directory.deregister(token).await {
        debug!("{:#}", e);
    }
    Ok(())
}
