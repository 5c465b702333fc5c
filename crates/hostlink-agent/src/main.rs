use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use hostlink_core::protocol::{
	decode_envelope, encode_message, WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES,
};
use hostlink_core::{next_backoff, INITIAL_BACKOFF};
use std::{
	env,
	fs::OpenOptions,
	io::{self, Write},
	path::PathBuf,
	sync::{Arc, Mutex as StdMutex},
	time::{Duration, Instant},
};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

mod bridge;
mod session;
mod tailer;

use bridge::{BridgePaths, FileBridge};
use session::{AgentSession, SessionSettings};

const SENDER_ID: &str = "agent";
const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:47800";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Parser, Debug)]
#[command(name = "hostlink-agent")]
struct Args {
	#[arg(long, default_value = "")]
	relay_url: String,
	#[arg(long, default_value = "")]
	relay_addr: String,
	#[arg(long, default_value = "")]
	bridge_dir: String,
	#[arg(long, default_value = bridge::DEFAULT_COMMANDS_FILE)]
	commands_file: String,
	#[arg(long, default_value = bridge::DEFAULT_ACKS_FILE)]
	acks_file: String,
	#[arg(long, default_value = bridge::DEFAULT_EVENTS_FILE)]
	events_file: String,
	#[arg(long, default_value = bridge::DEFAULT_CURSOR_FILE)]
	cursor_file: String,
	#[arg(long, default_value_t = 250)]
	poll_ms: u64,
	#[arg(long, default_value_t = 1000)]
	drain_ms: u64,
	#[arg(long, default_value_t = 2000)]
	alive_ms: u64,
	#[arg(long, default_value_t = 1000)]
	escalation_ms: u64,
	#[arg(long, default_value = "")]
	scenes_dir: String,
	#[arg(long, default_value = "")]
	log_dir: String,
	#[arg(long, default_value_t = false)]
	log_stdout: bool,
}

#[derive(Clone, Debug)]
struct RuntimeConfig {
	relay_url: Url,
	paths: BridgePaths,
	poll_interval: Duration,
	drain_interval: Duration,
	alive_interval: Duration,
	session: SessionSettings,
	log_dir: String,
	log_stdout: bool,
}

struct LogGuard {
	file: Option<Arc<StdMutex<std::fs::File>>>,
}

struct MultiWriter {
	stdout_enabled: bool,
	file: Option<Arc<StdMutex<std::fs::File>>>,
}

#[tokio::main]
async fn main() {
	let args = Args::parse();
	let config = match load_config(args) {
		Ok(config) => config,
		Err(err) => {
			eprintln!("error: {err}");
			std::process::exit(2);
		}
	};
	let _log_guard = init_logging(&config);

	let bridge = FileBridge::new(config.paths.clone());
	let mut session = match AgentSession::open(bridge, config.session.clone()).await {
		Ok(session) => session,
		Err(err) => {
			error!(event = "bridge_open_failed", error = %err);
			std::process::exit(1);
		}
	};
	info!(
		event = "agent_start",
		relay_url = %config.relay_url,
		inflight = session.inflight(),
		watermark = session.watermark()
	);

	tokio::select! {
		_ = relay_loop(&config, &mut session) => {}
		_ = tokio::signal::ctrl_c() => {
			info!(event = "agent_stop");
		}
	}
}

/// Connects, runs one session until the socket drops, and reconnects with
/// backoff. The reset on every connect keeps the host consistent with a relay
/// that may have restarted in between.
async fn relay_loop(config: &RuntimeConfig, session: &mut AgentSession) {
	let mut backoff = INITIAL_BACKOFF;
	loop {
		let mut ws = match connect_async(config.relay_url.clone()).await {
			Ok((ws, _)) => ws,
			Err(err) => {
				warn!(
					event = "relay_connect_error",
					error = %err,
					retry_ms = backoff.as_millis() as u64
				);
				tokio::time::sleep(backoff).await;
				backoff = next_backoff(backoff);
				continue;
			}
		};
		backoff = INITIAL_BACKOFF;
		info!(event = "relay_connected", url = %config.relay_url);

		if !send(&mut ws, session.hello()).await {
			warn!(event = "relay_hello_error");
			let _ = ws.close(None).await;
			continue;
		}
		if let Err(err) = session.on_connected(Instant::now()).await {
			warn!(event = "reset_begin_failed", error = %err);
		}

		run_connection(config, session, &mut ws).await;
		let _ = ws.close(None).await;
		warn!(event = "relay_disconnected", retry_ms = backoff.as_millis() as u64);
		tokio::time::sleep(backoff).await;
		backoff = next_backoff(backoff);
	}
}

fn ticker(period: Duration) -> tokio::time::Interval {
	let mut interval = tokio::time::interval(period);
	interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
	interval
}

async fn run_connection(config: &RuntimeConfig, session: &mut AgentSession, ws: &mut WsStream) {
	let mut ack_tick = ticker(config.poll_interval);
	let mut events_tick = ticker(config.poll_interval);
	let mut drain_tick = ticker(config.drain_interval);
	let mut alive_tick = ticker(config.alive_interval);

	loop {
		let outgoing = tokio::select! {
			frame = ws.next() => {
				let data = match frame {
					Some(Ok(Message::Text(text))) => text.into_bytes(),
					Some(Ok(Message::Binary(bytes))) => bytes,
					Some(Ok(Message::Close(_))) | None => return,
					Some(Ok(_)) => continue,
					Some(Err(err)) => {
						warn!(event = "relay_read_error", error = %err);
						return;
					}
				};
				let envelope = match decode_envelope(&data) {
					Ok(envelope) => envelope,
					Err(err) => {
						warn!(event = "message_invalid", error = %err);
						continue;
					}
				};
				session.handle(envelope.msg, Instant::now()).await
			}
			_ = ack_tick.tick() => session.poll_ack(Instant::now()).await,
			_ = events_tick.tick() => session.poll_events().await,
			_ = drain_tick.tick() => Ok(session.drain_report().into_iter().collect()),
			_ = alive_tick.tick() => Ok(vec![session.alive()]),
		};
		let messages = match outgoing {
			Ok(messages) => messages,
			Err(err) => {
				warn!(event = "bridge_error", error = %err);
				continue;
			}
		};
		for msg in messages {
			if !send(ws, msg).await {
				return;
			}
		}
	}
}

async fn send(ws: &mut WsStream, msg: WireMsg) -> bool {
	let kind = msg.kind();
	let envelope = WireEnvelope::new(SENDER_ID, msg);
	let text = match encode_message(&envelope, DEFAULT_MAX_FRAME_BYTES) {
		Ok(text) => text,
		Err(err) => {
			warn!(event = "encode_error", kind = kind, error = %err);
			return true;
		}
	};
	if let Err(err) = ws.send(Message::Text(text)).await {
		warn!(event = "relay_send_error", kind = kind, error = %err);
		return false;
	}
	true
}

fn load_config(args: Args) -> Result<RuntimeConfig, url::ParseError> {
	let relay_url = resolve_relay_url(&args.relay_url, &args.relay_addr)?;
	let bridge_dir = resolve_bridge_dir(&args.bridge_dir);
	let paths = BridgePaths::new(
		&bridge_dir,
		&args.commands_file,
		&args.acks_file,
		&args.events_file,
		&args.cursor_file,
	);
	let scenes_dir = if args.scenes_dir.trim().is_empty() {
		None
	} else {
		Some(PathBuf::from(args.scenes_dir))
	};
	Ok(RuntimeConfig {
		relay_url,
		paths,
		poll_interval: Duration::from_millis(args.poll_ms.max(1)),
		drain_interval: Duration::from_millis(args.drain_ms.max(1)),
		alive_interval: Duration::from_millis(args.alive_ms.max(1)),
		session: SessionSettings {
			escalation_interval: Duration::from_millis(args.escalation_ms),
			scenes_dir,
		},
		log_dir: resolve_log_dir(&args.log_dir),
		log_stdout: args.log_stdout || resolve_log_stdout(),
	})
}

fn init_logging(config: &RuntimeConfig) -> Option<LogGuard> {
	let level = if let Ok(level) = env::var("HOSTLINK_LOG_LEVEL") {
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
	// Without a log file there is nowhere else to write.
	let stdout_enabled = config.log_stdout || file.is_none();
	let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stdout_enabled));
	let subscriber = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(make_writer)
		.finish();
	if tracing::subscriber::set_global_default(subscriber).is_err() {
		return None;
	}
	Some(writer)
}

impl MultiWriter {
	fn new(file: Option<Arc<StdMutex<std::fs::File>>>, stdout_enabled: bool) -> Self {
		Self {
			stdout_enabled,
			file,
		}
	}
}

impl Write for MultiWriter {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		if self.stdout_enabled {
			let _ = io::stdout().write_all(buf);
		}
		if let Some(file) = &self.file {
			if let Ok(mut file) = file.lock() {
				let _ = file.write_all(buf);
			}
		}
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		if self.stdout_enabled {
			let _ = io::stdout().flush();
		}
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
		.open(dir.join("hostlink-agent.log"))?;
	Ok(LogGuard {
		file: Some(Arc::new(StdMutex::new(file))),
	})
}

fn resolve_relay_url(flag_url: &str, flag_addr: &str) -> Result<Url, url::ParseError> {
	if !flag_url.trim().is_empty() {
		return Url::parse(flag_url);
	}
	if let Ok(value) = env::var("HOSTLINK_RELAY_URL") {
		if !value.trim().is_empty() {
			return Url::parse(&value);
		}
	}
	let addr = if !flag_addr.trim().is_empty() {
		flag_addr.to_string()
	} else {
		match env::var("HOSTLINK_RELAY_ADDR") {
			Ok(value) if !value.trim().is_empty() => value,
			_ => DEFAULT_RELAY_ADDR.to_string(),
		}
	};
	Url::parse(&format!("ws://{addr}/ws"))
}

fn resolve_bridge_dir(flag: &str) -> PathBuf {
	if !flag.trim().is_empty() {
		return PathBuf::from(flag);
	}
	if let Ok(value) = env::var("HOSTLINK_BRIDGE_DIR") {
		if !value.trim().is_empty() {
			return PathBuf::from(value);
		}
	}
	PathBuf::from(".")
}

fn resolve_log_dir(flag: &str) -> String {
	if !flag.trim().is_empty() {
		return flag.to_string();
	}
	if let Ok(value) = env::var("HOSTLINK_LOG_DIR") {
		if !value.trim().is_empty() {
			return value;
		}
	}
	String::new()
}

fn resolve_log_stdout() -> bool {
	if let Ok(value) = env::var("HOSTLINK_LOG_STDOUT") {
		match value.trim() {
			"1" | "true" | "TRUE" | "yes" | "YES" => return true,
			"0" | "false" | "FALSE" | "no" | "NO" => return false,
			_ => {}
		}
	}
	false
}
