use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::{Parser, Subcommand};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

mod client;
mod relay;

use relay::RelayState;

const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:47800";

#[derive(Clone, Debug)]
pub struct Config {
    addr: String,
    debug: bool,
    allow_remote: bool,
    stale_seconds: u64,
    ping_interval: Duration,
    write_timeout: Duration,
    status_interval: Duration,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "hostlink-relay")]
struct Args {
    #[arg(long, default_value = "", global = true)]
    addr: String,
    #[arg(long, default_value_t = false, global = true)]
    debug: bool,
    #[arg(long, default_value_t = false)]
    allow_remote: bool,
    #[arg(long, default_value_t = 1000)]
    status_interval_ms: u64,
    #[arg(long, default_value_t = 30)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "", global = true)]
    log_dir: String,
    #[command(subcommand)]
    command: Option<ClientCommand>,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum ClientCommand {
    /// Submit one command and print the relay's answer.
    Submit {
        cmd: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        params: Vec<String>,
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
    },
    /// Ask the bound agent to resynchronize with the host.
    Reset {
        #[arg(long, default_value_t = 1)]
        wait_secs: u64,
    },
    /// Print every broadcast until interrupted.
    Watch,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = load_config(&args);
    let _log_guard = init_logging(&config);

    let Some(command) = args.command else {
        serve(config).await;
        return;
    };
    let url = match relay_url(&config.addr) {
        Ok(url) => url,
        Err(err) => {
            eprintln!("error: invalid relay addr '{}': {err}", config.addr);
            std::process::exit(2);
        }
    };
    let result = match command {
        ClientCommand::Submit {
            cmd,
            params,
            wait_secs,
        } => client::run_submit(&url, &cmd, &params, Duration::from_secs(wait_secs))
            .await
            .map(|seq| println!("accepted seq={seq}")),
        ClientCommand::Reset { wait_secs } => {
            client::run_reset(&url, Duration::from_secs(wait_secs))
                .await
                .map(|()| println!("reset requested"))
        }
        ClientCommand::Watch => {
            tokio::select! {
                result = client::run_watch(&url) => result,
                _ = tokio::signal::ctrl_c() => Ok(()),
            }
        }
    };
    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn serve(config: Config) {
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() && !config.allow_remote {
        error!(event = "invalid_addr", addr = %config.addr, reason = "not loopback");
        return;
    }

    let relay = Arc::new(RelayState::new(config.clone()));
    relay.clone().start_stale_reaper();
    relay.clone().start_status_heartbeat();
    let app = build_router(relay);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "relay_error", error = %err);
            return;
        }
    };

    info!(event = "relay_start", addr = %config.addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "relay_error", error = %err);
    }
    info!(event = "relay_stop");
}

fn build_router(relay: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(relay)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(relay): State<Arc<RelayState>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() && !relay.config().allow_remote {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        relay.handle_socket(socket, addr).await;
    })
}

fn load_config(args: &Args) -> Config {
    Config {
        addr: resolve_addr(&args.addr),
        debug: args.debug || env_true("HOSTLINK_DEBUG"),
        allow_remote: args.allow_remote,
        stale_seconds: args.stale_seconds,
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        status_interval: Duration::from_millis(args.status_interval_ms),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("HOSTLINK_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("hostlink-relay.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("HOSTLINK_RELAY_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_RELAY_ADDR.to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    if let Ok(value) = std::env::var("HOSTLINK_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    String::new()
}

fn relay_url(addr: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!("ws://{addr}/ws"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use hostlink_core::protocol::{
        decode_envelope, encode_message, AcceptedPayload, ClientHelloPayload, DrainPayload,
        EnqueuePayload, SubmitPayload, WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES,
    };
    use hostlink_core::Primitive;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config() -> Config {
        Config {
            addr: "127.0.0.1:0".to_string(),
            debug: false,
            allow_remote: false,
            stale_seconds: 0,
            ping_interval: Duration::ZERO,
            write_timeout: Duration::from_secs(2),
            status_interval: Duration::ZERO,
            log_dir: String::new(),
        }
    }

    async fn spawn_relay() -> Url {
        let relay = Arc::new(RelayState::new(test_config()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind relay");
        let addr = listener.local_addr().expect("local addr");
        let app = build_router(relay);
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });
        relay_url(&addr.to_string()).expect("relay url")
    }

    async fn open(url: &Url) -> Ws {
        let (ws, _) = connect_async(url.clone()).await.expect("connect");
        ws
    }

    async fn send(ws: &mut Ws, msg: WireMsg, request_id: Option<&str>) {
        let envelope =
            WireEnvelope::new("test", msg).with_request_id(request_id.map(str::to_string));
        let text = encode_message(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        ws.send(Message::Text(text)).await.expect("send");
    }

    async fn recv_until<F>(ws: &mut Ws, mut accept: F) -> WireEnvelope
    where
        F: FnMut(&WireEnvelope) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = ws.next().await.expect("stream open").expect("frame");
                if let Message::Text(text) = frame {
                    let envelope = decode_envelope(text.as_bytes()).expect("decode");
                    if accept(&envelope) {
                        return envelope;
                    }
                }
            }
        })
        .await
        .expect("message within timeout")
    }

    async fn bind_agent(url: &Url) -> Ws {
        let mut agent = open(url).await;
        send(
            &mut agent,
            WireMsg::ClientHello(ClientHelloPayload {
                version: "test".to_string(),
            }),
            None,
        )
        .await;
        recv_until(&mut agent, |env| {
            matches!(&env.msg, WireMsg::Status(status) if status.agent)
        })
        .await;
        agent
    }

    #[tokio::test]
    async fn submit_flows_from_observer_to_agent_and_back() {
        let url = spawn_relay().await;
        let mut agent = bind_agent(&url).await;
        let mut ui = open(&url).await;

        send(
            &mut ui,
            WireMsg::Submit(SubmitPayload {
                cmd: "GOTO".to_string(),
                params: vec![Primitive::from("stageA"), Primitive::Int(2)],
            }),
            Some("r1"),
        )
        .await;

        let accepted = recv_until(&mut ui, |env| matches!(env.msg, WireMsg::Accepted(_))).await;
        assert_eq!(accepted.request_id.as_deref(), Some("r1"));
        assert_eq!(
            accepted.msg,
            WireMsg::Accepted(AcceptedPayload {
                seq: 0,
                cmd: "GOTO stageA 2".to_string()
            })
        );
        let enqueue = recv_until(&mut agent, |env| matches!(env.msg, WireMsg::Enqueue(_))).await;
        assert_eq!(
            enqueue.msg,
            WireMsg::Enqueue(EnqueuePayload {
                seq: 0,
                line: "GOTO stageA 2".to_string()
            })
        );

        send(
            &mut agent,
            WireMsg::Drain(DrainPayload {
                last_ack: 0,
                inflight: 0,
            }),
            None,
        )
        .await;
        let acked = recv_until(&mut ui, |env| matches!(env.msg, WireMsg::Acked(_))).await;
        assert!(matches!(acked.msg, WireMsg::Acked(payload) if payload.seq == 0));
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply() {
        let url = spawn_relay().await;
        let mut ui = open(&url).await;
        ui.send(Message::Text("not json".to_string()))
            .await
            .expect("send");
        let reply = recv_until(&mut ui, |env| matches!(env.msg, WireMsg::Error(_))).await;
        assert!(matches!(reply.msg, WireMsg::Error(payload) if payload.code == "invalid_message"));
    }

    #[tokio::test]
    async fn client_submit_reports_seq_or_rejection() {
        let url = spawn_relay().await;
        let refused = client::run_submit(&url, "PING", &[], Duration::from_secs(5)).await;
        let message = format!("{:#}", refused.expect_err("no agent bound"));
        assert!(message.contains("no-client"), "{message}");

        let _agent = bind_agent(&url).await;
        let seq = client::run_submit(
            &url,
            "GOTO",
            &["stageA".to_string(), "2".to_string()],
            Duration::from_secs(5),
        )
        .await
        .expect("accepted");
        assert_eq!(seq, 0);
    }

    #[tokio::test]
    async fn client_reset_without_agent_fails() {
        let url = spawn_relay().await;
        let result = client::run_reset(&url, Duration::from_secs(2)).await;
        assert!(format!("{:#}", result.expect_err("no agent")).contains("no_agent"));
    }

    #[test]
    fn relay_url_targets_ws_endpoint() {
        let url = relay_url("127.0.0.1:47800").expect("url");
        assert_eq!(url.as_str(), "ws://127.0.0.1:47800/ws");
        assert_eq!(resolve_addr("10.0.0.1:9"), "10.0.0.1:9");
    }
}
