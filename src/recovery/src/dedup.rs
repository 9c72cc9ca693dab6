//! Dedup stage: collapses a fetched binlog segment into the
//! minimal set of `add` records that reproduce its final effect, using
//! the same split/overwrite/delete semantics the live index applies —
//! replayed here into a throwaway `ObIndex` rather than re-implemented.

use dfs_storage::binlog::BinlogRecord;
use dfs_storage::index::ObIndex;
use dfs_util::error::Result;

const SCRATCH_BUCKET_COUNT: usize = 64;

/// Last-writer-wins dedup per `(oid, offset)`: overlapping adds are split
/// the way `ObIndex::add_slice_by_binlog` already does, and deletes erase
/// prior adds in range. Returns an empty vector if the fetched segment
/// had no net effect (DEDUP: "If empty, break").
pub async fn dedup(file_block_size: u64, records: Vec<BinlogRecord>) -> Result<Vec<BinlogRecord>> {
	let scratch = ObIndex::new(SCRATCH_BUCKET_COUNT, file_block_size);

	for record in records {
		match record {
			BinlogRecord::Add {
				block,
				ssize,
				slice_type,
				space,
			} => {
				scratch.add_slice_by_binlog(block, ssize, slice_type, space).await?;
			}
			BinlogRecord::Delete { block, range } => {
				scratch.delete_slices_by_binlog(block, range).await?;
			}
			BinlogRecord::DeleteBlock { block } => {
				scratch.delete_block_by_binlog(block).await?;
			}
			BinlogRecord::NoOp { .. } => {}
		}
	}

	let mut out = Vec::new();
	for (block, slices) in scratch.dump_all().await {
		for (ssize, slice) in slices {
			out.push(BinlogRecord::Add {
				block,
				ssize,
				slice_type: slice.slice_type,
				space: slice.space,
			});
		}
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use dfs_storage::index::SliceType;
	use dfs_storage::keys::{BlockKey, SliceRange};
	use dfs_storage::trunk::{IdInfo, TrunkSpaceInfo};

	fn space(offset: u64, size: u64) -> TrunkSpaceInfo {
		TrunkSpaceInfo {
			store_path_index: 0,
			id_info: IdInfo { id: 1, subdir: 0 },
			offset,
			size,
		}
	}

	#[tokio::test]
	async fn overwrite_collapses_to_two_adds() {
		let block = BlockKey::new(1, 0);
		let records = vec![
			BinlogRecord::Add {
				block,
				ssize: SliceRange::new(0, 4096),
				slice_type: SliceType::File,
				space: space(0, 4096),
			},
			BinlogRecord::Add {
				block,
				ssize: SliceRange::new(1024, 1024),
				slice_type: SliceType::File,
				space: space(4096, 1024),
			},
		];

		let deduped = dedup(4096, records).await.unwrap();
		assert_eq!(deduped.len(), 3);
	}

	#[tokio::test]
	async fn trailing_delete_block_empties_the_segment() {
		let block = BlockKey::new(1, 0);
		let records = vec![
			BinlogRecord::Add {
				block,
				ssize: SliceRange::new(0, 1024),
				slice_type: SliceType::File,
				space: space(0, 1024),
			},
			BinlogRecord::DeleteBlock { block },
		];

		let deduped = dedup(4096, records).await.unwrap();
		assert!(deduped.is_empty());
	}

	#[tokio::test]
	async fn delete_erases_only_overlapping_add() {
		let block = BlockKey::new(2, 0);
		let records = vec![
			BinlogRecord::Add {
				block,
				ssize: SliceRange::new(0, 2048),
				slice_type: SliceType::File,
				space: space(0, 2048),
			},
			BinlogRecord::Delete {
				block,
				range: SliceRange::new(512, 256),
			},
		];

		let deduped = dedup(4096, records).await.unwrap();
		assert_eq!(deduped.len(), 2);
	}
}
