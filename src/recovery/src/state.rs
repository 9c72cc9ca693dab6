//! Persisted recovery checkpoint: `<data_path>/recovery_binlog/<group_id>/data_recovery.dat`,
//! an INI-style file with a top-level `stage` and a `[fetch]` cursor. This
//! is the core's own durability format, not general configuration, so it
//! is hand-parsed rather than routed through an external config loader.

use std::path::Path;

use dfs_util::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStage {
	Fetch,
	Dedup,
	Replay,
}

impl RecoveryStage {
	fn to_code(self) -> char {
		match self {
			RecoveryStage::Fetch => 'F',
			RecoveryStage::Dedup => 'D',
			RecoveryStage::Replay => 'R',
		}
	}

	fn from_code(c: char) -> Result<Self> {
		match c {
			'F' => Ok(RecoveryStage::Fetch),
			'D' => Ok(RecoveryStage::Dedup),
			'R' => Ok(RecoveryStage::Replay),
			other => Err(Error::Protocol(format!("unknown recovery stage code '{}'", other).into())),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCursor {
	pub last_data_version: i64,
	pub last_bkey: Option<(u64, u64)>,
}

impl FetchCursor {
	pub fn fresh() -> Self {
		Self {
			last_data_version: -1,
			last_bkey: None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysData {
	pub stage: RecoveryStage,
	pub fetch: FetchCursor,
	/// Highest `data_version` REPLAY has actually applied to the local
	/// index/binlog. Lags `fetch.last_data_version` until the no-op
	/// padding record is emitted at the end of REPLAY.
	pub applied_data_version: i64,
}

impl SysData {
	pub fn fresh() -> Self {
		Self {
			stage: RecoveryStage::Fetch,
			fetch: FetchCursor::fresh(),
			applied_data_version: -1,
		}
	}

	pub fn render(&self) -> String {
		let mut out = format!(
			"stage={}\napplied_data_version={}\n[fetch]\n",
			self.stage.to_code(),
			self.applied_data_version
		);
		out.push_str(&format!("last_data_version={}\n", self.fetch.last_data_version));
		if let Some((oid, offset)) = self.fetch.last_bkey {
			out.push_str(&format!("last_bkey={},{}\n", oid, offset));
		}
		out
	}

	pub fn parse(text: &str) -> Result<Self> {
		let mut stage = None;
		let mut applied_data_version = None;
		let mut last_data_version = None;
		let mut last_bkey = None;
		let mut in_fetch = false;

		for raw_line in text.lines() {
			let line = raw_line.trim();
			if line.is_empty() {
				continue;
			}
			if line == "[fetch]" {
				in_fetch = true;
				continue;
			}
			let (key, value) = line
				.split_once('=')
				.ok_or_else(|| Error::Protocol(format!("malformed sys-data line '{}'", line).into()))?;

			match (in_fetch, key) {
				(false, "stage") => {
					let c = value
						.chars()
						.next()
						.ok_or_else(|| Error::Protocol("empty stage value".into()))?;
					stage = Some(RecoveryStage::from_code(c)?);
				}
				(false, "applied_data_version") => {
					applied_data_version = Some(
						value
							.parse::<i64>()
							.map_err(|_| Error::Protocol("bad applied_data_version".into()))?,
					);
				}
				(true, "last_data_version") => {
					last_data_version = Some(
						value
							.parse::<i64>()
							.map_err(|_| Error::Protocol("bad last_data_version".into()))?,
					);
				}
				(true, "last_bkey") => {
					let (oid_s, off_s) = value
						.split_once(',')
						.ok_or_else(|| Error::Protocol("malformed last_bkey".into()))?;
					let oid = oid_s.parse::<u64>().map_err(|_| Error::Protocol("bad last_bkey oid".into()))?;
					let offset = off_s
						.parse::<u64>()
						.map_err(|_| Error::Protocol("bad last_bkey offset".into()))?;
					last_bkey = Some((oid, offset));
				}
				_ => return Err(Error::Protocol(format!("unexpected sys-data key '{}'", key).into())),
			}
		}

		Ok(Self {
			stage: stage.ok_or_else(|| Error::Protocol("missing stage".into()))?,
			fetch: FetchCursor {
				last_data_version: last_data_version.unwrap_or(-1),
				last_bkey,
			},
			applied_data_version: applied_data_version.unwrap_or(-1),
		})
	}

	/// Loads the checkpoint, or returns a fresh one if the file doesn't
	/// exist yet (`init`: "load sys-data (or create a fresh file
	/// at FETCH)").
	pub async fn load(path: &Path) -> Result<Self> {
		match tokio::fs::read_to_string(path).await {
			Ok(text) => Self::parse(&text),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::fresh()),
			Err(e) => Err(e.into()),
		}
	}

	pub async fn save(&self, path: &Path) -> Result<()> {
		dfs_util::fileops::atomic_write(path, self.render().as_bytes()).await
	}

	/// Removes the checkpoint file; recovery is complete and resumability
	/// is no longer needed (`Termination`).
	pub async fn delete(path: &Path) -> Result<()> {
		match tokio::fs::remove_file(path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn renders_and_parses_round_trip() {
		let data = SysData {
			stage: RecoveryStage::Dedup,
			fetch: FetchCursor {
				last_data_version: 42,
				last_bkey: Some((7, 1_048_576)),
			},
			applied_data_version: 40,
		};
		let text = data.render();
		let parsed = SysData::parse(&text).unwrap();
		assert_eq!(parsed, data);
	}

	#[test]
	fn parses_without_last_bkey() {
		let text = "stage=F\n[fetch]\nlast_data_version=-1\n";
		let parsed = SysData::parse(text).unwrap();
		assert_eq!(parsed.stage, RecoveryStage::Fetch);
		assert_eq!(parsed.fetch.last_bkey, None);
	}

	#[tokio::test]
	async fn load_missing_file_yields_fresh() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data_recovery.dat");
		let data = SysData::load(&path).await.unwrap();
		assert_eq!(data, SysData::fresh());
	}

	#[tokio::test]
	async fn save_then_load_round_trip_s5() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data_recovery.dat");
		let data = SysData {
			stage: RecoveryStage::Dedup,
			fetch: FetchCursor {
				last_data_version: 5,
				last_bkey: Some((1, 0)),
			},
			applied_data_version: 0,
		};
		data.save(&path).await.unwrap();

		let loaded = SysData::load(&path).await.unwrap();
		assert_eq!(loaded, data);
		assert_eq!(loaded.stage, RecoveryStage::Dedup);
	}

	#[tokio::test]
	async fn delete_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data_recovery.dat");
		SysData::fresh().save(&path).await.unwrap();
		SysData::delete(&path).await.unwrap();
		SysData::delete(&path).await.unwrap();
		assert!(!path.exists());
	}
}
