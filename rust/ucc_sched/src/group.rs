// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Capability/topology registry.
//!
//! A tree of groups (root -> device -> task queue -> compute unit). Device
//! groups carry the `XpuOps` backend that every compute unit below them
//! submits through. The `used` occupancy flag lives under the tree's own
//! lock, which is a leaf: callers may hold a CU lock while touching it, but
//! nothing is acquired while it is held.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use crate::completion::Completer;
use crate::error::{Result, UccError};
use crate::lock_unpoisoned;
use crate::types::{CuId, DevId, TsId};
use crate::vstream::VStream;

/// What a backend gets to know about the unit a submission runs on.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cu: CuId,
    pub dev: DevId,
    pub ts: TsId,
    completer: Completer,
}

impl RunContext {
    pub(crate) fn new(cu: CuId, dev: DevId, ts: TsId, completer: Completer) -> Self {
        Self {
            cu,
            dev,
            ts,
            completer,
        }
    }

    /// Handle the device uses to report finished commands, possibly later
    /// and from another thread.
    pub fn completer(&self) -> &Completer {
        &self.completer
    }
}

/// Device driver indirection.
pub trait XpuOps: Send + Sync {
    /// Take pending commands from `stream` (advancing its head through
    /// `VStream::update_head`) and hand them to the device. Returns the number
    /// of commands submitted; zero or a negative error code means nothing
    /// was submitted this round.
    fn run(&self, ctx: &RunContext, stream: &Arc<VStream>) -> i32;

    /// The stream is being torn down and no worker references it anymore.
    fn finish(&self, _stream: &VStream) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupRef(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Root,
    Device,
    TaskQueue,
    ComputeUnit,
}

struct GroupNode {
    id: u32,
    kind: GroupKind,
    parent: Option<GroupRef>,
    children: Vec<GroupRef>,
    used: bool,
    attached: bool,
    ops: Option<Arc<dyn XpuOps>>,
}

impl fmt::Debug for GroupNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("used", &self.used)
            .field("attached", &self.attached)
            .field("has_ops", &self.ops.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct XpuGroups {
    nodes: Mutex<Vec<GroupNode>>,
}

impl XpuGroups {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(vec![GroupNode {
                id: 0,
                kind: GroupKind::Root,
                parent: None,
                children: Vec::new(),
                used: false,
                attached: true,
                ops: None,
            }]),
        }
    }

    pub fn root(&self) -> GroupRef {
        GroupRef(0)
    }

    /// Attached child of `parent` with the given id.
    pub fn find(&self, parent: GroupRef, id: u32) -> Option<GroupRef> {
        let nodes = lock_unpoisoned(&self.nodes);
        nodes
            .get(parent.0)?
            .children
            .iter()
            .copied()
            .find(|child| nodes[child.0].id == id)
    }

    pub fn alloc_and_attach(&self, parent: GroupRef, kind: GroupKind, id: u32) -> Result<GroupRef> {
        let mut nodes = lock_unpoisoned(&self.nodes);
        let parent_node = nodes
            .get(parent.0)
            .ok_or(UccError::UnknownGroup(parent.0))?;
        let parent_id = parent_node.id;
        if parent_node
            .children
            .iter()
            .any(|child| nodes[child.0].id == id)
        {
            return Err(UccError::GroupExists {
                parent: parent_id,
                id,
            });
        }

        let group = GroupRef(nodes.len());
        nodes.push(GroupNode {
            id,
            kind,
            parent: Some(parent),
            children: Vec::new(),
            used: false,
            attached: true,
            ops: None,
        });
        nodes[parent.0].children.push(group);
        Ok(group)
    }

    /// Unlink `group` from its parent. Its own subtree stays intact.
    pub fn detach(&self, group: GroupRef) -> bool {
        let mut nodes = lock_unpoisoned(&self.nodes);
        let Some(parent) = nodes.get(group.0).and_then(|n| n.parent) else {
            return false;
        };
        if !nodes[group.0].attached {
            return false;
        }
        nodes[group.0].attached = false;
        nodes[parent.0].children.retain(|child| *child != group);
        true
    }

    /// First attached child of `parent` not marked used.
    pub fn idle_group_find(&self, parent: GroupRef) -> Option<GroupRef> {
        let nodes = lock_unpoisoned(&self.nodes);
        nodes
            .get(parent.0)?
            .children
            .iter()
            .copied()
            .find(|child| !nodes[child.0].used)
    }

    pub fn set_used(&self, group: GroupRef, used: bool) {
        if let Some(node) = lock_unpoisoned(&self.nodes).get_mut(group.0) {
            node.used = used;
        }
    }

    pub fn is_used(&self, group: GroupRef) -> bool {
        lock_unpoisoned(&self.nodes)
            .get(group.0)
            .map_or(false, |n| n.used)
    }

    pub fn set_ops(&self, group: GroupRef, ops: Arc<dyn XpuOps>) {
        if let Some(node) = lock_unpoisoned(&self.nodes).get_mut(group.0) {
            node.ops = Some(ops);
        }
    }

    /// Backend of the nearest ancestor (or `group` itself) that has one.
    pub fn ops(&self, group: GroupRef) -> Option<Arc<dyn XpuOps>> {
        let nodes = lock_unpoisoned(&self.nodes);
        let mut cursor = Some(group);
        while let Some(g) = cursor {
            let node = nodes.get(g.0)?;
            if let Some(ops) = &node.ops {
                return Some(ops.clone());
            }
            cursor = node.parent;
        }
        None
    }

    pub fn id(&self, group: GroupRef) -> Option<u32> {
        lock_unpoisoned(&self.nodes).get(group.0).map(|n| n.id)
    }

    pub fn kind(&self, group: GroupRef) -> Option<GroupKind> {
        lock_unpoisoned(&self.nodes).get(group.0).map(|n| n.kind)
    }

    pub fn children(&self, group: GroupRef) -> Vec<GroupRef> {
        lock_unpoisoned(&self.nodes)
            .get(group.0)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }
}

impl Default for XpuGroups {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl XpuOps for Nop {
        fn run(&self, _ctx: &RunContext, _stream: &Arc<VStream>) -> i32 {
            0
        }
    }

    #[test]
    fn test_attach_find_detach() {
        let groups = XpuGroups::new();
        let dev = groups
            .alloc_and_attach(groups.root(), GroupKind::Device, 3)
            .unwrap();
        assert_eq!(groups.find(groups.root(), 3), Some(dev));
        assert_eq!(groups.find(groups.root(), 4), None);
        assert_eq!(groups.kind(dev), Some(GroupKind::Device));

        assert!(matches!(
            groups.alloc_and_attach(groups.root(), GroupKind::Device, 3),
            Err(UccError::GroupExists { parent: 0, id: 3 })
        ));

        assert!(groups.detach(dev));
        assert!(!groups.detach(dev));
        assert_eq!(groups.find(groups.root(), 3), None);
        assert!(!groups.detach(groups.root()));
    }

    #[test]
    fn test_idle_group_find_skips_used() {
        let groups = XpuGroups::new();
        let ts = groups
            .alloc_and_attach(groups.root(), GroupKind::TaskQueue, 0)
            .unwrap();
        let cu0 = groups
            .alloc_and_attach(ts, GroupKind::ComputeUnit, 0)
            .unwrap();
        let cu1 = groups
            .alloc_and_attach(ts, GroupKind::ComputeUnit, 1)
            .unwrap();

        assert_eq!(groups.idle_group_find(ts), Some(cu0));
        groups.set_used(cu0, true);
        assert_eq!(groups.idle_group_find(ts), Some(cu1));
        groups.set_used(cu1, true);
        assert_eq!(groups.idle_group_find(ts), None);
        groups.set_used(cu0, false);
        assert_eq!(groups.idle_group_find(ts), Some(cu0));
    }

    #[test]
    fn test_ops_resolve_through_ancestors() {
        let groups = XpuGroups::new();
        let dev = groups
            .alloc_and_attach(groups.root(), GroupKind::Device, 0)
            .unwrap();
        let ts = groups.alloc_and_attach(dev, GroupKind::TaskQueue, 0).unwrap();
        let cu = groups
            .alloc_and_attach(ts, GroupKind::ComputeUnit, 0)
            .unwrap();
        assert!(groups.ops(cu).is_none());

        groups.set_ops(dev, Arc::new(Nop));
        assert!(groups.ops(cu).is_some());
        assert!(groups.ops(groups.root()).is_none());
    }
}
