//! Agent-side state: the mirror of the relay's inflight ledger, the ack
//! watermark read from the host, and the reset handshake.

use crate::bridge::{BridgeError, FileBridge};
use crate::tailer::OutputTailer;
use chrono::Utc;
use hostlink_core::protocol::{
	ClientAlivePayload, ClientHelloPayload, ClientScenesPayload, DrainPayload, OutputPayload,
	ResetAckPayload, WireMsg,
};
use hostlink_core::record::parse_command_line;
use hostlink_core::{Command, InflightLedger, ResetSession, NO_ACK};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub escalation_interval: Duration,
	pub scenes_dir: Option<PathBuf>,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			escalation_interval: hostlink_core::reset::DEFAULT_ESCALATION_INTERVAL,
			scenes_dir: None,
		}
	}
}

#[derive(Debug)]
struct Resetting {
	session: ResetSession,
	/// Commands that were inflight or arrived during the reset. Discarded on
	/// completion.
	side_buffer: Vec<Command>,
	ceiling_alerted: bool,
}

#[derive(Debug)]
enum Phase {
	Normal,
	Resetting(Resetting),
	/// `reset.ack` sent; enqueues are stale until the relay echoes it back.
	Confirming,
}

pub struct AgentSession {
	bridge: FileBridge,
	tailer: OutputTailer,
	ledger: InflightLedger,
	watermark: i64,
	phase: Phase,
	settings: SessionSettings,
}

/// Rebuilds the ledger from whatever the bridge holds and rewrites
/// pending-commands to exactly that ledger.
pub async fn reconcile(bridge: &FileBridge) -> Result<(InflightLedger, i64), BridgeError> {
	let watermark = bridge.read_watermark().await?;
	let mut ledger = InflightLedger::default();
	let mut dropped = 0usize;
	for line in bridge.read_pending().await? {
		if line.trim().is_empty() {
			continue;
		}
		let command = match parse_command_line(&line) {
			Ok(command) => command,
			Err(err) => {
				warn!(event = "pending_malformed", line = %line, error = %err);
				dropped += 1;
				continue;
			}
		};
		let in_range = i64::try_from(command.seq)
			.map(|seq| seq > watermark)
			.unwrap_or(false);
		if command.is_reset() || !in_range {
			dropped += 1;
			continue;
		}
		if let Err(err) = ledger.push(command) {
			warn!(event = "pending_dropped", error = %err);
			dropped += 1;
		}
	}
	bridge.write_pending(&ledger.render()).await?;
	info!(
		event = "bridge_reconciled",
		watermark = watermark,
		inflight = ledger.len(),
		dropped = dropped
	);
	Ok((ledger, watermark))
}

impl AgentSession {
	pub async fn open(bridge: FileBridge, settings: SessionSettings) -> Result<Self, BridgeError> {
		let (ledger, watermark) = reconcile(&bridge).await?;
		let tailer = OutputTailer::open(&bridge).await?;
		debug!(
			event = "bridge_opened",
			commands = %bridge.paths().commands.display(),
			cursor = tailer.cursor()
		);
		Ok(Self {
			bridge,
			tailer,
			ledger,
			watermark,
			phase: Phase::Normal,
			settings,
		})
	}

	pub fn watermark(&self) -> i64 {
		self.watermark
	}

	pub fn inflight(&self) -> usize {
		self.ledger.len()
	}

	pub fn is_resetting(&self) -> bool {
		matches!(self.phase, Phase::Resetting(_))
	}

	pub fn hello(&self) -> WireMsg {
		WireMsg::ClientHello(ClientHelloPayload {
			version: env!("CARGO_PKG_VERSION").to_string(),
		})
	}

	pub fn alive(&self) -> WireMsg {
		WireMsg::ClientAlive(ClientAlivePayload {
			ts: Utc::now().timestamp_millis(),
		})
	}

	/// Every fresh relay connection starts with a reset.
	pub async fn on_connected(&mut self, now: Instant) -> Result<(), BridgeError> {
		self.begin_reset(now).await
	}

	pub async fn begin_reset(&mut self, now: Instant) -> Result<(), BridgeError> {
		let side_buffer = match std::mem::replace(&mut self.phase, Phase::Normal) {
			Phase::Resetting(previous) => {
				info!(event = "reset_restarted", attempt_seq = previous.session.attempt_seq());
				let mut buffer = previous.side_buffer;
				buffer.extend(self.ledger.take_all());
				buffer
			}
			Phase::Normal | Phase::Confirming => self.ledger.take_all(),
		};
		let session = ResetSession::begin(self.watermark, now);
		let record = session.record();
		info!(
			event = "reset_begin",
			attempt_seq = record.seq,
			last_ack = self.watermark,
			side_buffer = side_buffer.len()
		);
		self.phase = Phase::Resetting(Resetting {
			session,
			side_buffer,
			ceiling_alerted: false,
		});
		self.bridge.write_pending(&format!("{record}\n")).await?;
		self.bridge.clear_events().await?;
		self.tailer.reset();
		Ok(())
	}

	/// Dispatches one message from the relay and returns the replies.
	pub async fn handle(
		&mut self,
		msg: WireMsg,
		now: Instant,
	) -> Result<Vec<WireMsg>, BridgeError> {
		match msg {
			WireMsg::Enqueue(payload) => {
				self.on_enqueue(Command::new(payload.seq, payload.line)).await?;
				Ok(Vec::new())
			}
			WireMsg::Reset(_) => {
				info!(event = "reset_requested");
				self.begin_reset(now).await?;
				Ok(Vec::new())
			}
			WireMsg::ResetAck(payload) => {
				if matches!(self.phase, Phase::Confirming) {
					info!(event = "reset_confirmed", seq = payload.seq);
					self.phase = Phase::Normal;
				}
				Ok(Vec::new())
			}
			WireMsg::ScanScenes(_) => Ok(vec![self.scan_scenes().await]),
			WireMsg::Error(payload) => {
				warn!(event = "relay_error", code = %payload.code, message = %payload.message);
				Ok(Vec::new())
			}
			other => {
				debug!(event = "relay_broadcast", kind = other.kind());
				Ok(Vec::new())
			}
		}
	}

	pub async fn on_enqueue(&mut self, command: Command) -> Result<(), BridgeError> {
		match &mut self.phase {
			Phase::Resetting(state) => {
				debug!(event = "enqueue_buffered", seq = command.seq);
				state.side_buffer.push(command);
				return Ok(());
			}
			Phase::Confirming => {
				warn!(event = "enqueue_stale", seq = command.seq);
				return Ok(());
			}
			Phase::Normal => {}
		}
		let expected = match self.ledger.last_seq() {
			Some(last) => last.saturating_add(1),
			None => (self.watermark + 1).max(0) as u64,
		};
		if command.seq != expected {
			warn!(event = "enqueue_out_of_sequence", seq = command.seq, expected = expected);
			return Ok(());
		}
		if let Err(err) = self.ledger.push(command) {
			warn!(event = "enqueue_rejected", error = %err);
			return Ok(());
		}
		self.bridge.write_pending(&self.ledger.render()).await
	}

	/// One ack-file poll: completes or escalates a reset, or trims the ledger
	/// when the host's watermark advanced.
	pub async fn poll_ack(&mut self, now: Instant) -> Result<Vec<WireMsg>, BridgeError> {
		let observed = self.bridge.read_watermark().await?;
		match &mut self.phase {
			Phase::Resetting(state) => {
				if state.session.is_satisfied_by(observed) {
					return self.complete_reset(observed).await;
				}
				if !state.session.escalation_due(now, self.settings.escalation_interval) {
					return Ok(Vec::new());
				}
				let attempt = state.session.escalate(now);
				warn!(
					event = "reset_escalated",
					attempt_seq = attempt,
					observed = observed,
					escalations = state.session.escalations()
				);
				let mut out = Vec::new();
				if state.session.at_ceiling() && !state.ceiling_alerted {
					state.ceiling_alerted = true;
					error!(event = "reset_ceiling", attempt_seq = attempt);
					out.push(WireMsg::error(
						"reset_ceiling",
						format!("host has not acknowledged RESET up to {attempt}; still retrying"),
					));
				}
				let record = state.session.record();
				self.bridge.write_pending(&format!("{record}\n")).await?;
				Ok(out)
			}
			Phase::Confirming => Ok(Vec::new()),
			Phase::Normal => {
				if observed < self.watermark {
					debug!(
						event = "ack_regressed",
						observed = observed,
						watermark = self.watermark
					);
					return Ok(Vec::new());
				}
				if observed == self.watermark {
					return Ok(Vec::new());
				}
				self.watermark = observed;
				let removed = self.ledger.trim_through(observed);
				if !removed.is_empty() {
					self.bridge.write_pending(&self.ledger.render()).await?;
				}
				debug!(
					event = "ack_advanced",
					watermark = observed,
					removed = removed.len(),
					inflight = self.ledger.len()
				);
				Ok(self.drain_report().into_iter().collect())
			}
		}
	}

	/// The phase moves to Confirming only once every bridge write succeeded.
	/// Acks are cleared last; the host's ack must survive a failed attempt.
	async fn complete_reset(&mut self, observed: i64) -> Result<Vec<WireMsg>, BridgeError> {
		self.bridge.clear_events().await?;
		self.bridge.write_pending("").await?;
		self.bridge.clear_acks().await?;
		let discarded = match std::mem::replace(&mut self.phase, Phase::Confirming) {
			Phase::Resetting(state) => state.side_buffer.len(),
			_ => 0,
		};
		self.tailer.reset();
		self.watermark = NO_ACK;
		self.ledger.clear();
		info!(event = "reset_complete", observed = observed, discarded = discarded);
		Ok(vec![WireMsg::ResetAck(ResetAckPayload {
			seq: observed.max(0) as u64,
		})])
	}

	/// Periodic flow-control report; suppressed while a reset is in progress.
	pub fn drain_report(&self) -> Option<WireMsg> {
		match self.phase {
			Phase::Normal => Some(WireMsg::Drain(DrainPayload {
				last_ack: self.watermark,
				inflight: self.ledger.len(),
			})),
			_ => None,
		}
	}

	pub async fn poll_events(&mut self) -> Result<Vec<WireMsg>, BridgeError> {
		if self.is_resetting() {
			return Ok(Vec::new());
		}
		let mut out = Vec::new();
		let malformed = self.tailer.malformed();
		self.tailer
			.poll(&self.bridge, |event| {
				out.push(WireMsg::Output(OutputPayload {
					seq: event.seq,
					cmd: event.name,
					params: event.args,
				}))
			})
			.await?;
		if self.tailer.malformed() > malformed {
			debug!(event = "events_malformed_total", total = self.tailer.malformed());
		}
		Ok(out)
	}

	pub async fn scan_scenes(&self) -> WireMsg {
		let scenes = match &self.settings.scenes_dir {
			Some(dir) => list_scenes(dir).await,
			None => Vec::new(),
		};
		WireMsg::ClientScenes(ClientScenesPayload { scenes })
	}
}

async fn list_scenes(dir: &Path) -> Vec<String> {
	let mut entries = match fs::read_dir(dir).await {
		Ok(entries) => entries,
		Err(err) => {
			debug!(event = "scenes_unavailable", dir = %dir.display(), error = %err);
			return Vec::new();
		}
	};
	let mut scenes = Vec::new();
	loop {
		match entries.next_entry().await {
			Ok(Some(entry)) => {
				match entry.file_type().await {
					Ok(kind) if kind.is_file() => {}
					_ => continue,
				}
				let path = entry.path();
				if let Some(stem) = path.file_stem() {
					scenes.push(stem.to_string_lossy().to_string());
				}
			}
			Ok(None) => break,
			Err(err) => {
				warn!(event = "scenes_read_error", dir = %dir.display(), error = %err);
				break;
			}
		}
	}
	scenes.sort();
	scenes.dedup();
	scenes
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bridge::BridgePaths;
	use hostlink_core::protocol::{EnqueuePayload, ErrorPayload, ResetPayload};
	use hostlink_core::reset::ESCALATION_CEILING;
	use std::io::Write;

	fn bridge_in(dir: &Path) -> FileBridge {
		FileBridge::new(BridgePaths::in_dir(dir))
	}

	fn pending(dir: &Path) -> String {
		std::fs::read_to_string(dir.join("commands.txt")).unwrap_or_default()
	}

	fn ack(dir: &Path, seq: i64) {
		let mut file = std::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(dir.join("acks.txt"))
			.expect("open acks");
		writeln!(file, "{seq}").expect("append ack");
	}

	fn enqueue(seq: u64, line: &str) -> WireMsg {
		WireMsg::Enqueue(EnqueuePayload {
			seq,
			line: line.to_string(),
		})
	}

	/// Opens a session and walks it through the connect-time reset.
	async fn connected(dir: &Path) -> AgentSession {
		let mut session = AgentSession::open(bridge_in(dir), SessionSettings::default())
			.await
			.expect("open");
		let now = Instant::now();
		session.on_connected(now).await.expect("connect");
		let attempt = session.watermark() + 1;
		ack(dir, attempt);
		let out = session.poll_ack(now).await.expect("poll");
		assert!(matches!(out.as_slice(), [WireMsg::ResetAck(_)]));
		session
			.handle(WireMsg::ResetAck(ResetAckPayload { seq: attempt as u64 }), now)
			.await
			.expect("confirm");
		session
	}

	#[tokio::test]
	async fn reconcile_keeps_only_unacked_ordered_commands() {
		let dir = tempfile::tempdir().expect("tempdir");
		std::fs::write(
			dir.path().join("commands.txt"),
			"0 A\n1 RESET\nbad line\n3 C\n2 B\n4 D x 1\n",
		)
		.expect("seed pending");
		std::fs::write(dir.path().join("acks.txt"), "0\n").expect("seed acks");

		let bridge = bridge_in(dir.path());
		let (ledger, watermark) = reconcile(&bridge).await.expect("reconcile");
		assert_eq!(watermark, 0);
		assert_eq!(ledger.len(), 2);
		let first = pending(dir.path());
		assert_eq!(first, "3 C\n4 D x 1\n");

		reconcile(&bridge).await.expect("reconcile again");
		assert_eq!(pending(dir.path()), first);
	}

	#[tokio::test]
	async fn reconcile_drops_seq_beyond_watermark_range() {
		let dir = tempfile::tempdir().expect("tempdir");
		std::fs::write(
			dir.path().join("commands.txt"),
			format!("0 A\n{} HUGE\n1 B\n", u64::MAX),
		)
		.expect("seed pending");

		let (ledger, watermark) = reconcile(&bridge_in(dir.path())).await.expect("reconcile");
		assert_eq!(watermark, -1);
		assert_eq!(ledger.len(), 2);
		assert_eq!(pending(dir.path()), "0 A\n1 B\n");
	}

	#[tokio::test]
	async fn reconcile_tolerates_missing_files() {
		let dir = tempfile::tempdir().expect("tempdir");
		let (ledger, watermark) = reconcile(&bridge_in(dir.path())).await.expect("reconcile");
		assert!(ledger.is_empty());
		assert_eq!(watermark, -1);
		assert_eq!(pending(dir.path()), "");
	}

	#[tokio::test]
	async fn host_ack_trims_ledger_and_reports_drain() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut session = connected(dir.path()).await;
		let now = Instant::now();
		session.handle(enqueue(0, "X"), now).await.expect("enqueue");
		session.handle(enqueue(1, "GOTO stageA 2"), now).await.expect("enqueue");
		assert_eq!(pending(dir.path()), "0 X\n1 GOTO stageA 2\n");

		ack(dir.path(), 0);
		let out = session.poll_ack(now).await.expect("poll");
		assert_eq!(
			out,
			vec![WireMsg::Drain(DrainPayload {
				last_ack: 0,
				inflight: 1
			})]
		);
		assert_eq!(session.watermark(), 0);
		assert_eq!(session.inflight(), 1);
		assert_eq!(pending(dir.path()), "1 GOTO stageA 2\n");
		assert!(session.poll_ack(now).await.expect("idle poll").is_empty());
	}

	#[tokio::test]
	async fn reconnect_rewrites_pending_to_single_reset_record() {
		let dir = tempfile::tempdir().expect("tempdir");
		std::fs::write(dir.path().join("acks.txt"), "7\n").expect("seed acks");
		std::fs::write(dir.path().join("commands.txt"), "8 A\n9 B\n").expect("seed pending");
		let mut session = AgentSession::open(bridge_in(dir.path()), SessionSettings::default())
			.await
			.expect("open");
		let start = Instant::now();
		session.on_connected(start).await.expect("connect");
		assert_eq!(pending(dir.path()), "8 RESET\n");
		assert!(session.drain_report().is_none());

		assert!(session
			.poll_ack(start + Duration::from_millis(500))
			.await
			.expect("poll")
			.is_empty());
		assert_eq!(pending(dir.path()), "8 RESET\n");

		session.poll_ack(start + Duration::from_secs(1)).await.expect("escalate");
		assert_eq!(pending(dir.path()), "1000000 RESET\n");

		ack(dir.path(), 8);
		let out = session
			.poll_ack(start + Duration::from_millis(1200))
			.await
			.expect("complete");
		assert_eq!(out, vec![WireMsg::ResetAck(ResetAckPayload { seq: 8 })]);
		assert_eq!(session.watermark(), -1);
		assert_eq!(pending(dir.path()), "");
		assert_eq!(std::fs::read_to_string(dir.path().join("acks.txt")).expect("acks"), "");
	}

	#[tokio::test]
	async fn failed_cleanup_keeps_reset_pending_until_a_later_poll() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut session = AgentSession::open(bridge_in(dir.path()), SessionSettings::default())
			.await
			.expect("open");
		let now = Instant::now();
		session.on_connected(now).await.expect("connect");

		let events = dir.path().join("events.txt");
		std::fs::remove_file(&events).expect("remove events");
		std::fs::create_dir(&events).expect("events dir");
		std::fs::write(events.join("blocker"), "x").expect("blocker");
		ack(dir.path(), 0);
		assert!(session.poll_ack(now).await.is_err());
		assert!(session.is_resetting());
		assert_eq!(std::fs::read_to_string(dir.path().join("acks.txt")).expect("acks"), "0\n");

		std::fs::remove_dir_all(&events).expect("remove events dir");
		let out = session.poll_ack(now).await.expect("retry");
		assert_eq!(out, vec![WireMsg::ResetAck(ResetAckPayload { seq: 0 })]);
		session
			.handle(WireMsg::ResetAck(ResetAckPayload { seq: 0 }), now)
			.await
			.expect("confirm");
		session.handle(enqueue(0, "A"), now).await.expect("enqueue");
		assert_eq!(session.inflight(), 1);
	}

	#[tokio::test]
	async fn enqueue_during_reset_is_buffered_not_written() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut session = AgentSession::open(bridge_in(dir.path()), SessionSettings::default())
			.await
			.expect("open");
		let now = Instant::now();
		session.on_connected(now).await.expect("connect");
		session.handle(enqueue(0, "X"), now).await.expect("enqueue");
		assert_eq!(pending(dir.path()), "0 RESET\n");
		assert_eq!(session.inflight(), 0);
	}

	#[tokio::test]
	async fn enqueue_before_confirmation_is_dropped() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut session = AgentSession::open(bridge_in(dir.path()), SessionSettings::default())
			.await
			.expect("open");
		let now = Instant::now();
		session.on_connected(now).await.expect("connect");
		ack(dir.path(), 0);
		session.poll_ack(now).await.expect("complete");
		session.handle(enqueue(0, "stale"), now).await.expect("enqueue");
		assert_eq!(session.inflight(), 0);
		assert!(session.drain_report().is_none());

		session
			.handle(WireMsg::ResetAck(ResetAckPayload { seq: 0 }), now)
			.await
			.expect("confirm");
		session.handle(enqueue(0, "fresh"), now).await.expect("enqueue");
		assert_eq!(pending(dir.path()), "0 fresh\n");
	}

	#[tokio::test]
	async fn out_of_sequence_enqueue_is_dropped() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut session = connected(dir.path()).await;
		let now = Instant::now();
		session.handle(enqueue(3, "late"), now).await.expect("enqueue");
		assert_eq!(session.inflight(), 0);
		session.handle(enqueue(0, "A"), now).await.expect("enqueue");
		session.handle(enqueue(0, "A again"), now).await.expect("enqueue");
		assert_eq!(pending(dir.path()), "0 A\n");
	}

	#[tokio::test]
	async fn explicit_reset_moves_ledger_aside_and_restarts_from_watermark() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut session = connected(dir.path()).await;
		let now = Instant::now();
		for (seq, line) in ["A", "B", "C"].iter().enumerate() {
			session.handle(enqueue(seq as u64, line), now).await.expect("enqueue");
		}
		ack(dir.path(), 0);
		session.poll_ack(now).await.expect("ack");

		session
			.handle(WireMsg::Reset(ResetPayload::default()), now)
			.await
			.expect("reset");
		assert!(session.is_resetting());
		assert_eq!(session.inflight(), 0);
		assert_eq!(pending(dir.path()), "1 RESET\n");

		session
			.handle(WireMsg::Reset(ResetPayload::default()), now)
			.await
			.expect("reset again");
		assert_eq!(pending(dir.path()), "1 RESET\n");
	}

	#[tokio::test]
	async fn ceiling_alert_is_sent_once() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut session = AgentSession::open(bridge_in(dir.path()), SessionSettings::default())
			.await
			.expect("open");
		let start = Instant::now();
		session.on_connected(start).await.expect("connect");

		let mut alerts = 0;
		for step in 1..=15u64 {
			let out = session
				.poll_ack(start + Duration::from_secs(step))
				.await
				.expect("poll");
			alerts += out
				.iter()
				.filter(|msg| {
					matches!(
						msg,
						WireMsg::Error(ErrorPayload { code, .. }) if code == "reset_ceiling"
					)
				})
				.count();
		}
		assert_eq!(alerts, 1);
		assert_eq!(pending(dir.path()), format!("{ESCALATION_CEILING} RESET\n"));
		assert!(session.is_resetting());
	}

	#[tokio::test]
	async fn events_are_forwarded_as_output() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut session = connected(dir.path()).await;
		std::fs::write(dir.path().join("events.txt"), "0 ready [stageA]\n1 score [3]\n")
			.expect("seed events");
		let out = session.poll_events().await.expect("poll");
		assert_eq!(out.len(), 2);
		assert!(matches!(
			&out[0],
			WireMsg::Output(payload) if payload.seq == 0 && payload.cmd == "ready"
		));
		assert!(session.poll_events().await.expect("poll again").is_empty());
	}

	#[tokio::test]
	async fn scenes_are_listed_by_sorted_stem() {
		let dir = tempfile::tempdir().expect("tempdir");
		let scenes = dir.path().join("scenes");
		std::fs::create_dir_all(scenes.join("nested")).expect("scenes dir");
		for name in ["stageB.tscn", "stageA.tscn", "menu.tscn"] {
			std::fs::write(scenes.join(name), "").expect("scene");
		}
		let settings = SessionSettings {
			scenes_dir: Some(scenes),
			..SessionSettings::default()
		};
		let session = AgentSession::open(bridge_in(dir.path()), settings)
			.await
			.expect("open");
		assert_eq!(
			session.scan_scenes().await,
			WireMsg::ClientScenes(ClientScenesPayload {
				scenes: vec!["menu".to_string(), "stageA".to_string(), "stageB".to_string()],
			})
		);
	}
}
