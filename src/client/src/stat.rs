//! Batched cluster-stat: query one data group, or iterate
//! every group id, skipping groups a prior response already covered
//! because it is co-located on the same server. The source's fixed
//! 1024-entry stack array with heap overflow is simplified to a plain
//! `Vec` (see DESIGN.md) — allocation-size tiering doesn't carry
//! semantic weight once the C-style stack/heap split is gone.

use std::collections::HashSet;

use async_trait::async_trait;

use dfs_rpc::cluster::DataGroupId;
use dfs_util::error::Result;

/// One data group's reported stat payload plus every other group id the
/// same response already answered for ("mark as handled every
/// data-group id that appears in the response").
#[derive(Debug, Clone)]
pub struct GroupStat {
	pub group_id: DataGroupId,
	pub covers: Vec<DataGroupId>,
	pub body: Vec<u8>,
}

/// Abstracts the `cluster-stat` RPC itself; the wire framing is out of
/// scope, only the batching/dedup logic is this module's job.
#[async_trait]
pub trait ClusterStatSource: Send + Sync {
	async fn query_group(&self, group: DataGroupId) -> Result<GroupStat>;
}

/// Queries `group` alone, or every group id `0..group_count` while
/// skipping ids a previous response already covered.
pub async fn cluster_stat(
	source: &dyn ClusterStatSource,
	group: Option<DataGroupId>,
	group_count: u64,
) -> Result<Vec<GroupStat>> {
	if let Some(g) = group {
		return Ok(vec![source.query_group(g).await?]);
	}

	let mut handled: HashSet<DataGroupId> = HashSet::new();
	let mut out = Vec::new();

	for g in 0..group_count {
		if handled.contains(&g) {
			continue;
		}
		let stat = source.query_group(g).await?;
		handled.insert(stat.group_id);
		for covered in &stat.covers {
			handled.insert(*covered);
		}
		out.push(stat);
	}

	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::sync::Mutex;

	struct FakeSource {
		queried: Mutex<Vec<DataGroupId>>,
		colocated: Vec<Vec<DataGroupId>>,
	}

	#[async_trait]
	impl ClusterStatSource for FakeSource {
		async fn query_group(&self, group: DataGroupId) -> Result<GroupStat> {
			self.queried.lock().await.push(group);
			Ok(GroupStat {
				group_id: group,
				covers: self.colocated[group as usize].clone(),
				body: vec![],
			})
		}
	}

	#[tokio::test]
	async fn single_group_request_queries_only_that_group() {
		let source = FakeSource {
			queried: Mutex::new(vec![]),
			colocated: vec![vec![], vec![], vec![]],
		};
		let stats = cluster_stat(&source, Some(1), 3).await.unwrap();
		assert_eq!(stats.len(), 1);
		assert_eq!(*source.queried.lock().await, vec![1]);
	}

	#[tokio::test]
	async fn colocated_groups_are_not_requeried() {
		// group 0's response also answers for groups 1 and 2 (same server).
		let source = FakeSource {
			queried: Mutex::new(vec![]),
			colocated: vec![vec![1, 2], vec![], vec![], vec![]],
		};
		let stats = cluster_stat(&source, None, 4).await.unwrap();
		// only groups 0 and 3 are ever queried
		assert_eq!(*source.queried.lock().await, vec![0, 3]);
		assert_eq!(stats.len(), 2);
	}
}
