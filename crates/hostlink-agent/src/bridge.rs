//! The four files shared with the host process.
//!
//! Every write goes through [`write_atomic`], so the host never observes a
//! half-written pending-commands or cursor file.

use hostlink_core::NO_ACK;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

pub const DEFAULT_COMMANDS_FILE: &str = "commands.txt";
pub const DEFAULT_ACKS_FILE: &str = "acks.txt";
pub const DEFAULT_EVENTS_FILE: &str = "events.txt";
pub const DEFAULT_CURSOR_FILE: &str = "events.cursor";

#[derive(Debug, Error)]
pub enum BridgeError {
	#[error("read {}: {source}", .path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("write {}: {source}", .path.display())]
	Write {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("replace {}: {source}", .path.display())]
	Rename {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

#[derive(Debug, Clone)]
pub struct BridgePaths {
	pub commands: PathBuf,
	pub acks: PathBuf,
	pub events: PathBuf,
	pub cursor: PathBuf,
}

impl BridgePaths {
	pub fn new(dir: &Path, commands: &str, acks: &str, events: &str, cursor: &str) -> Self {
		Self {
			commands: dir.join(commands),
			acks: dir.join(acks),
			events: dir.join(events),
			cursor: dir.join(cursor),
		}
	}

	pub fn in_dir(dir: &Path) -> Self {
		Self::new(
			dir,
			DEFAULT_COMMANDS_FILE,
			DEFAULT_ACKS_FILE,
			DEFAULT_EVENTS_FILE,
			DEFAULT_CURSOR_FILE,
		)
	}
}

#[derive(Debug, Clone)]
pub struct FileBridge {
	paths: BridgePaths,
}

impl FileBridge {
	pub fn new(paths: BridgePaths) -> Self {
		Self { paths }
	}

	pub fn paths(&self) -> &BridgePaths {
		&self.paths
	}

	pub async fn write_pending(&self, body: &str) -> Result<(), BridgeError> {
		write_atomic(&self.paths.commands, body).await
	}

	/// Raw pending-commands lines; a missing file reads as empty.
	pub async fn read_pending(&self) -> Result<Vec<String>, BridgeError> {
		Ok(read_optional(&self.paths.commands)
			.await?
			.map(|body| body.lines().map(str::to_string).collect())
			.unwrap_or_default())
	}

	/// The host's ack watermark: the last parseable line, or -1.
	pub async fn read_watermark(&self) -> Result<i64, BridgeError> {
		let Some(body) = read_optional(&self.paths.acks).await? else {
			return Ok(NO_ACK);
		};
		Ok(parse_watermark(&body))
	}

	pub async fn clear_acks(&self) -> Result<(), BridgeError> {
		write_atomic(&self.paths.acks, "").await
	}

	pub async fn read_events(&self) -> Result<Option<String>, BridgeError> {
		read_optional(&self.paths.events).await
	}

	/// Empties host-events and resets the cursor to -1.
	pub async fn clear_events(&self) -> Result<(), BridgeError> {
		write_atomic(&self.paths.events, "").await?;
		self.write_cursor(NO_ACK).await
	}

	pub async fn read_cursor(&self) -> Result<i64, BridgeError> {
		let Some(body) = read_optional(&self.paths.cursor).await? else {
			return Ok(NO_ACK);
		};
		match body.trim().parse::<i64>() {
			Ok(cursor) if cursor >= NO_ACK => Ok(cursor),
			_ => {
				warn!(
					event = "cursor_invalid",
					path = %self.paths.cursor.display(),
					value = %body.trim()
				);
				Ok(NO_ACK)
			}
		}
	}

	pub async fn write_cursor(&self, cursor: i64) -> Result<(), BridgeError> {
		write_atomic(&self.paths.cursor, &format!("{cursor}\n")).await
	}
}

pub fn parse_watermark(body: &str) -> i64 {
	body
		.lines()
		.filter_map(|line| line.trim().parse::<i64>().ok())
		.filter(|value| *value >= NO_ACK)
		.last()
		.unwrap_or(NO_ACK)
}

async fn read_optional(path: &Path) -> Result<Option<String>, BridgeError> {
	match fs::read_to_string(path).await {
		Ok(body) => Ok(Some(body)),
		Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
		Err(source) => Err(BridgeError::Read {
			path: path.to_path_buf(),
			source,
		}),
	}
}

/// Writes `<name>.tmp` and renames it over `path`. A failed rename is retried
/// once before giving up.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<(), BridgeError> {
	if let Some(parent) = path.parent() {
		if !parent.as_os_str().is_empty() {
			fs::create_dir_all(parent)
				.await
				.map_err(|source| BridgeError::Write {
					path: parent.to_path_buf(),
					source,
				})?;
		}
	}
	let temp_path = match path.file_name() {
		Some(name) => path.with_file_name(format!("{}.tmp", name.to_string_lossy())),
		None => path.with_extension("tmp"),
	};
	fs::write(&temp_path, contents)
		.await
		.map_err(|source| BridgeError::Write {
			path: temp_path.clone(),
			source,
		})?;
	if let Err(err) = fs::rename(&temp_path, path).await {
		warn!(event = "rename_retry", path = %path.display(), error = %err);
		fs::rename(&temp_path, path)
			.await
			.map_err(|source| BridgeError::Rename {
				path: path.to_path_buf(),
				source,
			})?;
	}
	Ok(())
}
