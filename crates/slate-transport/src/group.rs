//! Sub-communicators: a fixed subset of a parent communicator's ranks, used for
//! column/row broadcasts that must not involve every rank in the grid. Construction is
//! just capturing the membership; teardown drops it. No new channels are opened, since
//! the underlying transport already routes to any rank.

use std::sync::Arc;

use slate_constants::SlateError;

use crate::communicator::Communicator;

/// A named view over a subset of `parent`'s ranks. Every `CommGroup` method validates
/// that the calling rank is actually a member before delegating, so a caller mistakenly
/// using the wrong group gets `InvalidArgument` instead of silently blocking forever.
pub struct CommGroup<C: Communicator> {
    parent: Arc<C>,
    members: Vec<u32>,
}

impl<C: Communicator> CommGroup<C> {
    /// Builds a group over `members` (deduplicated and sorted). Fails if `members` is
    /// empty or names a rank outside `parent`.
    pub fn new(parent: Arc<C>, mut members: Vec<u32>) -> Result<Self, SlateError> {
        members.sort_unstable();
        members.dedup();
        if members.is_empty() {
            return Err(SlateError::InvalidArgument("communicator group must have at least one member".to_string()));
        }
        if let Some(&max) = members.last() {
            if max >= parent.size() {
                return Err(SlateError::InvalidArgument(format!(
                    "group member {max} is out of range for a communicator of size {}",
                    parent.size()
                )));
            }
        }
        Ok(Self { parent, members })
    }

    pub fn members(&self) -> &[u32] {
        &self.members
    }

    pub fn contains(&self, rank: u32) -> bool {
        self.members.binary_search(&rank).is_ok()
    }

    fn require_membership(&self) -> Result<(), SlateError> {
        if !self.contains(self.parent.rank()) {
            return Err(SlateError::InvalidArgument(format!(
                "rank {} is not a member of this communicator group",
                self.parent.rank()
            )));
        }
        Ok(())
    }

    pub fn broadcast(&self, root: u32, tag: u32, payload: Option<Vec<u8>>) -> Result<Vec<u8>, SlateError> {
        self.require_membership()?;
        self.parent.broadcast(root, &self.members, tag, payload)
    }

    pub fn barrier(&self) -> Result<(), SlateError> {
        self.require_membership()?;
        self.parent.barrier(&self.members)
    }

    /// Releases this group. Since no dedicated channels are owned by a `CommGroup`, this
    /// is purely documentation of intent at call sites that have an explicit
    /// sub-communicator lifecycle.
    pub fn teardown(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inprocess::build_cluster;

    #[test]
    fn group_rejects_out_of_range_member() {
        let cluster = build_cluster(2);
        let parent = Arc::new(cluster.into_iter().next().expect("rank 0"));
        let error = CommGroup::new(parent, vec![0, 5]).expect_err("rank 5 is out of range");
        assert!(matches!(error, SlateError::InvalidArgument(_)));
    }

    #[test]
    fn group_rejects_empty_membership() {
        let cluster = build_cluster(2);
        let parent = Arc::new(cluster.into_iter().next().expect("rank 0"));
        let error = CommGroup::new(parent, Vec::new()).expect_err("empty group is rejected");
        assert!(matches!(error, SlateError::InvalidArgument(_)));
    }

    #[test]
    fn broadcast_on_group_excludes_non_members() {
        let cluster = build_cluster(3);
        let handles: Vec<Arc<_>> = cluster.into_iter().map(Arc::new).collect();
        let members = vec![0, 2];

        let mut joins = Vec::new();
        for handle in &handles {
            if !members.contains(&handle.rank()) {
                continue;
            }
            let handle = Arc::clone(handle);
            let members = members.clone();
            joins.push(std::thread::spawn(move || {
                let group = CommGroup::new(handle.clone(), members).expect("build group");
                let payload = if handle.rank() == 0 { Some(vec![5]) } else { None };
                group.broadcast(0, 3, payload).expect("group broadcast")
            }));
        }
        for join in joins {
            assert_eq!(join.join().expect("thread joins"), vec![5]);
        }
    }
}
