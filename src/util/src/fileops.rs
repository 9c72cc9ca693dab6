//! Durable file-write helpers. Every on-disk structure that must survive
//! a crash (trunk descriptors, recovery sys-data, staged recovery binlog
//! segments) goes through `atomic_write`, which writes to a temp file,
//! fsyncs it, renames it into place, and fsyncs the containing directory
//! so the rename itself is durable.

use std::path::{Path, PathBuf};

use rand::prelude::*;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// Writes `data` to `path` durably: temp file + fsync + rename + parent
/// directory fsync. If a temp file is left behind by a crash mid-write,
/// it is simply orphaned (cleaned up by operators or a future pass);
/// it never becomes the visible `path` because the rename never ran.
pub async fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
	let dir = path
		.parent()
		.map(Path::to_path_buf)
		.unwrap_or_else(|| PathBuf::from("."));
	fs::create_dir_all(&dir).await?;

	let tmp_ext = format!("tmp{}", hex::encode(thread_rng().gen::<[u8; 4]>()));
	let mut tmp_path = path.to_path_buf();
	match tmp_path.file_name().map(|n| n.to_owned()) {
		Some(name) => {
			let mut name = name.into_string().unwrap_or_default();
			name.push('.');
			name.push_str(&tmp_ext);
			tmp_path.set_file_name(name);
		}
		None => {
			tmp_path.set_extension(tmp_ext);
		}
	}

	let mut guard = DeleteOnDrop(Some(tmp_path.clone()));

	let mut f = fs::File::create(&tmp_path).await?;
	f.write_all(data).await?;
	f.sync_all().await?;
	drop(f);

	fs::rename(&tmp_path, path).await?;
	guard.cancel();

	sync_dir(&dir).await?;
	Ok(())
}

async fn sync_dir(dir: &Path) -> Result<()> {
	let f = fs::File::open(dir).await?;
	f.sync_all().await?;
	Ok(())
}

/// Appends `data` to the file at `path`, opening/creating it if needed,
/// flushing and fsyncing before returning. Used by the slice binlog and
/// staged recovery segments, where durability must be established
/// before any reply is sent.
pub async fn append_and_sync(path: &Path, data: &[u8]) -> Result<()> {
	if let Some(dir) = path.parent() {
		fs::create_dir_all(dir).await?;
	}
	let mut f = fs::OpenOptions::new()
		.create(true)
		.append(true)
		.open(path)
		.await?;
	f.write_all(data).await?;
	f.sync_all().await?;
	Ok(())
}

struct DeleteOnDrop(Option<PathBuf>);

impl DeleteOnDrop {
	fn cancel(&mut self) {
		self.0 = None;
	}
}

impl Drop for DeleteOnDrop {
	fn drop(&mut self) {
		if let Some(path) = self.0.take() {
			tokio::spawn(async move {
				if let Err(e) = fs::remove_file(&path).await {
					tracing::debug!("cleanup of temp file {} failed: {}", path.display(), e);
				}
			});
		}
	}
}
