//! Object/block index: the in-memory map from
//! `(object-id, block-offset)` to an ordered, non-overlapping set of
//! stored slices, mutated under per-bucket locks.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use dfs_util::error::{Error, Result};

use crate::keys::{BlockKey, SliceRange};
use crate::trunk::{TrunkAllocator, TrunkSpaceInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
	File,
	Cache,
}

/// `OBSliceEntry`: one stored slice. `refcount` is managed
/// explicitly by callers (incref/decref), not by `Drop`, because the
/// moment a slice becomes unreachable must line up exactly with the
/// index mutation that unlinked it and the binlog record that durably
/// recorded that mutation — a `Drop` impl could not
/// promise that ordering.
#[derive(Debug, Clone)]
pub struct ObSliceEntry {
	pub slice_type: SliceType,
	pub ssize: SliceRange,
	pub space: TrunkSpaceInfo,
	pub refcount: Arc<AtomicU64>,
}

impl ObSliceEntry {
	fn new(slice_type: SliceType, ssize: SliceRange, space: TrunkSpaceInfo) -> Self {
		Self {
			slice_type,
			ssize,
			space,
			refcount: Arc::new(AtomicU64::new(1)),
		}
	}

	pub fn incref(&self) -> u64 {
		self.refcount.fetch_add(1, Ordering::AcqRel) + 1
	}

	pub fn decref(&self) -> u64 {
		self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
	}
}

/// `OBEntry`: an existence record for one `BlockKey` owning a
/// non-overlapping, offset-ordered sequence of slices. The `BTreeMap`
/// keyed by slice offset is the small ordered container this calls
/// for — lookup and in-order iteration are both `O(log n)`/`O(k)`
/// without an intrusive list.
pub struct ObEntry {
	pub block: BlockKey,
	slices: BTreeMap<u32, ObSliceEntry>,
}

impl ObEntry {
	fn new(block: BlockKey) -> Self {
		Self {
			block,
			slices: BTreeMap::new(),
		}
	}

	fn overlapping_keys(&self, range: &SliceRange) -> Vec<u32> {
		self.slices
			.iter()
			.filter(|(_, s)| s.ssize.overlaps(range))
			.map(|(k, _)| *k)
			.collect()
	}

	pub fn is_empty(&self) -> bool {
		self.slices.is_empty()
	}

	pub fn len(&self) -> usize {
		self.slices.len()
	}

	/// Checks invariant #1: consecutive slices never overlap.
	pub fn check_non_overlap_invariant(&self) -> bool {
		let mut prev_end: Option<u32> = None;
		for s in self.slices.values() {
			if let Some(pe) = prev_end {
				if s.ssize.offset < pe {
					return false;
				}
			}
			prev_end = Some(s.ssize.end());
		}
		true
	}
}

/// Splits an overlapped slice against `incoming`, returning the residual
/// sub-ranges of the original slice that fall *outside* `incoming`
/// (overwrites "split, truncate, or replace existing slices
/// to preserve the non-overlap invariant").
fn residuals(old: &ObSliceEntry, incoming: &SliceRange) -> Vec<ObSliceEntry> {
	let mut out = Vec::with_capacity(2);
	if old.ssize.offset < incoming.offset {
		let len = incoming.offset - old.ssize.offset;
		let range = SliceRange::new(old.ssize.offset, len);
		let space = TrunkSpaceInfo {
			offset: old.space.offset,
			size: len as u64,
			..old.space
		};
		out.push(ObSliceEntry {
			slice_type: old.slice_type,
			ssize: range,
			space,
			refcount: Arc::new(AtomicU64::new(1)),
		});
	}
	if old.ssize.end() > incoming.end() {
		let skipped = incoming.end() - old.ssize.offset;
		let len = old.ssize.end() - incoming.end();
		let range = SliceRange::new(incoming.end(), len);
		let space = TrunkSpaceInfo {
			offset: old.space.offset + skipped as u64,
			size: len as u64,
			..old.space
		};
		out.push(ObSliceEntry {
			slice_type: old.slice_type,
			ssize: range,
			space,
			refcount: Arc::new(AtomicU64::new(1)),
		});
	}
	out
}

struct Bucket {
	entries: HashMap<BlockKey, ObEntry>,
}

/// Fixed-capacity hash table of buckets keyed by `hash(BlockKey) mod
/// capacity`, each with its own lock. Capacity is
/// configuration-driven and fixed after construction.
pub struct ObIndex {
	buckets: Vec<Mutex<Bucket>>,
	file_block_size: u64,
	sn: AtomicU64,
}

impl ObIndex {
	pub fn new(capacity: usize, file_block_size: u64) -> Self {
		let capacity = capacity.max(1);
		Self {
			buckets: (0..capacity)
				.map(|_| {
					Mutex::new(Bucket {
						entries: HashMap::new(),
					})
				})
				.collect(),
			file_block_size,
			sn: AtomicU64::new(0),
		}
	}

	pub fn file_block_size(&self) -> u64 {
		self.file_block_size
	}

	fn bucket_index(&self, block: &BlockKey) -> usize {
		let mut h = DefaultHasher::new();
		block.hash(&mut h);
		(h.finish() as usize) % self.buckets.len()
	}

	fn next_sn(&self) -> u64 {
		self.sn.fetch_add(1, Ordering::AcqRel) + 1
	}

	/// `add_slice`. Splits and releases any slices the new
	/// range overlaps, attaches the new slice, and returns the process-wide
	/// version number and `inc_alloc` (new bytes minus released bytes).
	pub async fn add_slice(
		&self,
		trunk: &TrunkAllocator,
		block: BlockKey,
		ssize: SliceRange,
		slice_type: SliceType,
		space: TrunkSpaceInfo,
	) -> Result<(u64, i64)> {
		if !ssize.is_valid(self.file_block_size as u32) {
			return Err(Error::Invalid("slice range out of block bounds".into()));
		}

		let mut bucket = self.buckets[self.bucket_index(&block)].lock().await;
		let entry = bucket
			.entries
			.entry(block)
			.or_insert_with(|| ObEntry::new(block));

		let mut released: i64 = 0;
		for key in entry.overlapping_keys(&ssize) {
			let old = entry.slices.remove(&key).expect("key came from this map");
			trunk.delete_slice(&old.space).await?;
			released += old.ssize.length as i64;

			for residual in residuals(&old, &ssize) {
				trunk.add_slice(&residual.space).await?;
				released -= residual.ssize.length as i64;
				entry.slices.insert(residual.ssize.offset, residual);
			}
		}

		trunk.add_slice(&space).await?;
		entry
			.slices
			.insert(ssize.offset, ObSliceEntry::new(slice_type, ssize, space));

		let inc_alloc = space.size as i64 - released;
		Ok((self.next_sn(), inc_alloc))
	}

	/// `delete_slices`. Returns `NotFound` iff nothing
	/// overlapped the requested range.
	pub async fn delete_slices(
		&self,
		trunk: &TrunkAllocator,
		block: BlockKey,
		range: SliceRange,
	) -> Result<(u64, u64)> {
		let mut bucket = self.buckets[self.bucket_index(&block)].lock().await;
		let entry = bucket.entries.get_mut(&block).ok_or(Error::NotFound)?;

		let keys = entry.overlapping_keys(&range);
		if keys.is_empty() {
			return Err(Error::NotFound);
		}

		let mut dec_alloc: u64 = 0;
		for key in keys {
			let old = entry.slices.remove(&key).expect("key came from this map");
			trunk.delete_slice(&old.space).await?;
			let mut retained = 0u32;
			for residual in residuals(&old, &range) {
				trunk.add_slice(&residual.space).await?;
				retained += residual.ssize.length;
				entry.slices.insert(residual.ssize.offset, residual);
			}
			dec_alloc += (old.ssize.length - retained) as u64;
		}

		if entry.is_empty() {
			bucket.entries.remove(&block);
		}

		Ok((self.next_sn(), dec_alloc))
	}

	/// `delete_block`: removes the whole `OBEntry` and
	/// releases every byte it owned.
	pub async fn delete_block(&self, trunk: &TrunkAllocator, block: BlockKey) -> Result<(u64, u64)> {
		let mut bucket = self.buckets[self.bucket_index(&block)].lock().await;
		let entry = bucket.entries.remove(&block).ok_or(Error::NotFound)?;

		let mut dec_alloc = 0u64;
		for slice in entry.slices.values() {
			trunk.delete_slice(&slice.space).await?;
			dec_alloc += slice.ssize.length as u64;
		}
		Ok((self.next_sn(), dec_alloc))
	}

	/// `get_slices`: all slices overlapping `range`, clipped
	/// to it, in offset order, read under the bucket lock.
	pub async fn get_slices(&self, block: BlockKey, range: SliceRange) -> Vec<(SliceRange, ObSliceEntry)> {
		let bucket = self.buckets[self.bucket_index(&block)].lock().await;
		let Some(entry) = bucket.entries.get(&block) else {
			return Vec::new();
		};

		let mut out = Vec::new();
		for slice in entry.slices.values() {
			if let Some(clip) = slice.ssize.intersect(&range) {
				out.push((clip, slice.clone()));
			}
		}
		out
	}

	/// Dumps every live `(block, slices)` pair, each slice list in offset
	/// order. Used by recovery's dedup pass, which replays a fetched binlog
	/// segment into a scratch `ObIndex` and reads back the minimal
	/// surviving mutation set.
	pub async fn dump_all(&self) -> Vec<(BlockKey, Vec<(SliceRange, ObSliceEntry)>)> {
		let mut out = Vec::new();
		for bucket in &self.buckets {
			let bucket = bucket.lock().await;
			for entry in bucket.entries.values() {
				let slices: Vec<_> = entry
					.slices
					.values()
					.map(|s| (s.ssize, s.clone()))
					.collect();
				out.push((entry.block, slices));
			}
		}
		out
	}

	// ---- Binlog replay: index-only mutations, no trunk accounting ----
	//
	// Trunk `used.bytes`/`free_start` are not live during binlog load
	//: they are reconstructed in one pass over the
	// *final* surviving index via `rebuild_trunk_usage`, once every
	// binlog record has been replayed. Doing per-record trunk accounting
	// here would double-count bytes whenever an `add` record overlapped
	// an earlier one, since the original add already has a later
	// counterpart account for in the final-state rebuild.

	pub async fn add_slice_by_binlog(
		&self,
		block: BlockKey,
		ssize: SliceRange,
		slice_type: SliceType,
		space: TrunkSpaceInfo,
	) -> Result<()> {
		if !ssize.is_valid(self.file_block_size as u32) {
			return Err(Error::Invalid("slice range out of block bounds".into()));
		}
		let mut bucket = self.buckets[self.bucket_index(&block)].lock().await;
		let entry = bucket
			.entries
			.entry(block)
			.or_insert_with(|| ObEntry::new(block));

		for key in entry.overlapping_keys(&ssize) {
			let old = entry.slices.remove(&key).expect("key came from this map");
			for residual in residuals(&old, &ssize) {
				entry.slices.insert(residual.ssize.offset, residual);
			}
		}
		entry
			.slices
			.insert(ssize.offset, ObSliceEntry::new(slice_type, ssize, space));
		Ok(())
	}

	pub async fn delete_slices_by_binlog(&self, block: BlockKey, range: SliceRange) -> Result<()> {
		let mut bucket = self.buckets[self.bucket_index(&block)].lock().await;
		let Some(entry) = bucket.entries.get_mut(&block) else {
			return Ok(());
		};
		for key in entry.overlapping_keys(&range) {
			let old = entry.slices.remove(&key).expect("key came from this map");
			for residual in residuals(&old, &range) {
				entry.slices.insert(residual.ssize.offset, residual);
			}
		}
		if entry.is_empty() {
			bucket.entries.remove(&block);
		}
		Ok(())
	}

	pub async fn delete_block_by_binlog(&self, block: BlockKey) -> Result<()> {
		let mut bucket = self.buckets[self.bucket_index(&block)].lock().await;
		bucket.entries.remove(&block);
		Ok(())
	}

	/// Rebuilds every trunk's `used.bytes/count` and `free_start` from
	/// the final, post-replay index state. Must run once, after the
	/// whole binlog has been replayed (see module docs above).
	pub async fn rebuild_trunk_usage(&self, trunks_by_path: &[Arc<TrunkAllocator>]) -> Result<()> {
		for bucket in &self.buckets {
			let bucket = bucket.lock().await;
			for entry in bucket.entries.values() {
				for slice in entry.slices.values() {
					let trunk = trunks_by_path
						.get(slice.space.store_path_index)
						.ok_or(Error::NotFound)?;
					trunk.add_slice_by_binlog(&slice.space).await?;
				}
			}
		}
		Ok(())
	}

	pub async fn block_count(&self) -> usize {
		let mut total = 0;
		for bucket in &self.buckets {
			total += bucket.lock().await.entries.len();
		}
		total
	}

	pub async fn check_all_non_overlap_invariants(&self) -> bool {
		for bucket in &self.buckets {
			let bucket = bucket.lock().await;
			if !bucket.entries.values().all(|e| e.check_non_overlap_invariant()) {
				return false;
			}
		}
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::trunk::IdInfo;

	fn space(trunk_id: u64, offset: u64, size: u64) -> TrunkSpaceInfo {
		TrunkSpaceInfo {
			store_path_index: 0,
			id_info: IdInfo { id: trunk_id, subdir: 0 },
			offset,
			size,
		}
	}

	async fn new_trunk_with(id: u64, size: u64) -> TrunkAllocator {
		let t = TrunkAllocator::new(0, 1, 1);
		t.add(IdInfo { id, subdir: 0 }, size).await;
		t
	}

	#[tokio::test]
	async fn s1_write_read_round_trip() {
		let idx = ObIndex::new(16, 4096);
		let trunk = new_trunk_with(1, 8192).await;
		let block = BlockKey::new(1, 0);

		idx.add_slice(
			&trunk,
			block,
			SliceRange::new(0, 4096),
			SliceType::File,
			space(1, 0, 4096),
		)
		.await
		.unwrap();

		let got = idx.get_slices(block, SliceRange::new(0, 4096)).await;
		assert_eq!(got.len(), 1);
		assert_eq!(got[0].0, SliceRange::new(0, 4096));
		assert_eq!(got[0].1.space, space(1, 0, 4096));
	}

	#[tokio::test]
	async fn s2_overwrite_split() {
		let idx = ObIndex::new(16, 4096);
		let trunk = new_trunk_with(1, 8192).await;
		let block = BlockKey::new(1, 0);

		idx.add_slice(
			&trunk,
			block,
			SliceRange::new(0, 4096),
			SliceType::File,
			space(1, 0, 4096),
		)
		.await
		.unwrap();

		let (_, inc_alloc) = idx
			.add_slice(
				&trunk,
				block,
				SliceRange::new(1024, 1024),
				SliceType::File,
				space(1, 4096, 1024),
			)
			.await
			.unwrap();
		assert_eq!(inc_alloc, 0);

		let got = idx.get_slices(block, SliceRange::new(0, 4096)).await;
		assert_eq!(got.len(), 3);
		assert_eq!(got[0].0, SliceRange::new(0, 1024));
		assert_eq!(got[0].1.space.offset, 0);
		assert_eq!(got[1].0, SliceRange::new(1024, 1024));
		assert_eq!(got[1].1.space.offset, 4096);
		assert_eq!(got[2].0, SliceRange::new(2048, 2048));
		assert_eq!(got[2].1.space.offset, 2048);
	}

	#[tokio::test]
	async fn s3_delete_range() {
		let idx = ObIndex::new(16, 4096);
		let trunk = new_trunk_with(1, 8192).await;
		let block = BlockKey::new(1, 0);

		idx.add_slice(&trunk, block, SliceRange::new(0, 4096), SliceType::File, space(1, 0, 4096))
			.await
			.unwrap();
		idx.add_slice(&trunk, block, SliceRange::new(1024, 1024), SliceType::File, space(1, 4096, 1024))
			.await
			.unwrap();

		let (_, dec_alloc) = idx
			.delete_slices(&trunk, block, SliceRange::new(512, 1536))
			.await
			.unwrap();
		assert_eq!(dec_alloc, 1536);

		let got = idx.get_slices(block, SliceRange::new(0, 4096)).await;
		assert_eq!(got.len(), 2);
		assert_eq!(got[0].0, SliceRange::new(0, 512));
		assert_eq!(got[0].1.space.offset, 0);
		assert_eq!(got[1].0, SliceRange::new(2048, 2048));
		assert_eq!(got[1].1.space.offset, 2048);
	}

	#[tokio::test]
	async fn delete_slices_not_found_when_nothing_overlaps() {
		let idx = ObIndex::new(16, 4096);
		let trunk = new_trunk_with(1, 8192).await;
		let block = BlockKey::new(1, 0);
		let res = idx.delete_slices(&trunk, block, SliceRange::new(0, 100)).await;
		assert!(matches!(res, Err(Error::NotFound)));
	}

	#[tokio::test]
	async fn delete_block_releases_all_bytes() {
		let idx = ObIndex::new(16, 4096);
		let trunk = new_trunk_with(1, 8192).await;
		let block = BlockKey::new(7, 0);
		idx.add_slice(&trunk, block, SliceRange::new(0, 2048), SliceType::File, space(1, 0, 2048))
			.await
			.unwrap();
		idx.add_slice(&trunk, block, SliceRange::new(2048, 2048), SliceType::File, space(1, 2048, 2048))
			.await
			.unwrap();

		let (_, dec_alloc) = idx.delete_block(&trunk, block).await.unwrap();
		assert_eq!(dec_alloc, 4096);
		assert!(idx.get_slices(block, SliceRange::new(0, 4096)).await.is_empty());
	}

	#[tokio::test]
	async fn replay_matches_live_mutation_property_3() {
		let live_idx = ObIndex::new(16, 4096);
		let live_trunk = new_trunk_with(1, 8192).await;
		let block = BlockKey::new(3, 0);

		live_idx
			.add_slice(&live_trunk, block, SliceRange::new(0, 4096), SliceType::File, space(1, 0, 4096))
			.await
			.unwrap();
		live_idx
			.add_slice(&live_trunk, block, SliceRange::new(1024, 1024), SliceType::File, space(1, 4096, 1024))
			.await
			.unwrap();
		live_idx
			.delete_slices(&live_trunk, block, SliceRange::new(512, 1536))
			.await
			.unwrap();

		let replay_idx = ObIndex::new(16, 4096);
		replay_idx
			.add_slice_by_binlog(block, SliceRange::new(0, 4096), SliceType::File, space(1, 0, 4096))
			.await
			.unwrap();
		replay_idx
			.add_slice_by_binlog(block, SliceRange::new(1024, 1024), SliceType::File, space(1, 4096, 1024))
			.await
			.unwrap();
		replay_idx
			.delete_slices_by_binlog(block, SliceRange::new(512, 1536))
			.await
			.unwrap();

		let live = live_idx.get_slices(block, SliceRange::new(0, 4096)).await;
		let replayed = replay_idx.get_slices(block, SliceRange::new(0, 4096)).await;
		assert_eq!(live.len(), replayed.len());
		for (a, b) in live.iter().zip(replayed.iter()) {
			assert_eq!(a.0, b.0);
			assert_eq!(a.1.space, b.1.space);
		}
	}

	#[tokio::test]
	async fn rebuild_trunk_usage_matches_final_index() {
		let idx = ObIndex::new(16, 4096);
		let block = BlockKey::new(9, 0);
		idx.add_slice_by_binlog(block, SliceRange::new(0, 4096), SliceType::File, space(1, 0, 4096))
			.await
			.unwrap();
		idx.add_slice_by_binlog(block, SliceRange::new(1024, 1024), SliceType::File, space(1, 4096, 1024))
			.await
			.unwrap();

		let trunk = Arc::new(new_trunk_with(1, 8192).await);
		idx.rebuild_trunk_usage(&[trunk.clone()]).await.unwrap();

		let (_, _, used_bytes, used_count) = trunk.trunk_snapshot(1).await.unwrap();
		assert_eq!(used_count, 3);
		assert_eq!(used_bytes, 1024 + 1024 + 2048);
		assert!(trunk.check_all_invariants().await);
	}
}
