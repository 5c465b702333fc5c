use crate::bridge::{BridgeError, FileBridge};
use hostlink_core::record::parse_event_line;
use hostlink_core::{OutputEvent, NO_ACK};
use tracing::{debug, info, warn};

/// Follows the host-events file and hands each new record to the caller,
/// persisting the cursor after every record.
///
/// The host restarts its stream either by rewriting the file (it shrinks or
/// its first line changes) or by appending a seq 0 record after a positive
/// one. Both reset the cursor to -1 so the new records are forwarded.
#[derive(Debug)]
pub struct OutputTailer {
	cursor: i64,
	/// Complete lines already examined.
	consumed: usize,
	first_line: Option<String>,
	/// Seq of the last parseable line examined.
	prev_seq: Option<u64>,
	malformed: u64,
}

impl OutputTailer {
	pub fn new(cursor: i64) -> Self {
		Self {
			cursor,
			consumed: 0,
			first_line: None,
			prev_seq: None,
			malformed: 0,
		}
	}

	pub async fn open(bridge: &FileBridge) -> Result<Self, BridgeError> {
		Ok(Self::new(bridge.read_cursor().await?))
	}

	pub fn cursor(&self) -> i64 {
		self.cursor
	}

	pub fn malformed(&self) -> u64 {
		self.malformed
	}

	/// Forget everything consumed; used after the bridge cleared host-events.
	pub fn reset(&mut self) {
		self.cursor = NO_ACK;
		self.consumed = 0;
		self.first_line = None;
		self.prev_seq = None;
	}

	/// Examines complete lines added since the last poll and forwards records
	/// with `seq > cursor`. Returns how many were forwarded.
	pub async fn poll<F>(
		&mut self,
		bridge: &FileBridge,
		mut forward: F,
	) -> Result<usize, BridgeError>
	where
		F: FnMut(OutputEvent),
	{
		let body = bridge.read_events().await?.unwrap_or_default();
		let complete = match body.rfind('\n') {
			Some(end) => &body[..=end],
			None => "",
		};
		let lines: Vec<&str> = complete.lines().collect();
		let rewritten = lines.len() < self.consumed
			|| (self.consumed > 0 && self.first_line.as_deref() != lines.first().copied());
		if rewritten {
			info!(event = "events_rewritten", previous = self.consumed, current = lines.len());
			self.reset();
		}
		if self.first_line.is_none() {
			self.first_line = lines.first().map(|line| line.to_string());
		}

		let mut forwarded = 0;
		for line in &lines[self.consumed..] {
			self.consumed += 1;
			if line.trim().is_empty() {
				continue;
			}
			let (event, seq) = match parse_event_line(line) {
				Ok(event) => match i64::try_from(event.seq) {
					Ok(seq) => (event, seq),
					Err(err) => {
						self.malformed += 1;
						warn!(event = "event_malformed", line = %line, error = %err);
						continue;
					}
				},
				Err(err) => {
					self.malformed += 1;
					warn!(event = "event_malformed", line = %line, error = %err);
					continue;
				}
			};
			if event.seq == 0 && self.prev_seq.map(|prev| prev > 0).unwrap_or(false) {
				info!(event = "events_restarted", cursor = self.cursor);
				self.cursor = NO_ACK;
			}
			self.prev_seq = Some(event.seq);
			if seq <= self.cursor {
				debug!(event = "event_skipped", seq = event.seq, cursor = self.cursor);
				continue;
			}
			forward(event);
			self.cursor = seq;
			bridge.write_cursor(self.cursor).await?;
			forwarded += 1;
		}
		Ok(forwarded)
	}
}
