//! Node tree: groups and synths in a preallocated slot arena
//!
//! Nodes live in fixed slots; parent, sibling and child relations are slot
//! indices threaded through the node headers, so walking or relinking the
//! tree never allocates. A bounded id map resolves the protocol-visible
//! `NodeId` to its slot.

use std::collections::HashMap;

use aria_core::{EngineError, EngineResult};

use crate::synth::SynthState;

/// Stable protocol-visible node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The root group, created at engine construction
    pub const ROOT: Self = Self(0);
}

/// Where to attach a new node relative to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddAction {
    /// First child of the target's enclosing group
    ToHead,
    /// Last child of the target's enclosing group
    ToTail,
    /// Immediately before the target node
    Before,
    /// Immediately after the target node
    After,
}

impl AddAction {
    pub fn from_i32(value: i32) -> EngineResult<Self> {
        match value {
            0 => Ok(AddAction::ToHead),
            1 => Ok(AddAction::ToTail),
            2 => Ok(AddAction::Before),
            3 => Ok(AddAction::After),
            _ => Err(EngineError::InvalidArgument),
        }
    }
}

pub(crate) type Slot = u32;

/// Fields shared by every node variant
pub(crate) struct NodeHeader {
    pub id: NodeId,
    pub parent: Option<Slot>,
    pub prev: Option<Slot>,
    pub next: Option<Slot>,
    /// Liveness references; the node owns one, plugins may retain more
    pub refs: u32,
}

/// Child list of a group
#[derive(Default)]
pub(crate) struct GroupState {
    pub first: Option<Slot>,
    pub last: Option<Slot>,
}

pub(crate) enum NodeBody {
    Group(GroupState),
    Synth(SynthState),
}

pub(crate) struct Node {
    pub header: NodeHeader,
    pub body: NodeBody,
}

impl Node {
    pub fn group(id: NodeId) -> Self {
        Self {
            header: NodeHeader {
                id,
                parent: None,
                prev: None,
                next: None,
                refs: 1,
            },
            body: NodeBody::Group(GroupState::default()),
        }
    }

    pub fn synth(id: NodeId, state: SynthState) -> Self {
        Self {
            header: NodeHeader {
                id,
                parent: None,
                prev: None,
                next: None,
                refs: 1,
            },
            body: NodeBody::Synth(state),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.body, NodeBody::Group(_))
    }
}

/// Preallocated node storage with a bounded id map
///
/// The map's hash storage is reserved up front and occupancy never
/// exceeds it, so audio-thread insertion cannot rehash.
pub(crate) struct NodeArena {
    slots: Vec<Option<Node>>,
    free: Vec<Slot>,
    map: HashMap<u32, Slot>,
}

impl NodeArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity as Slot).rev().collect(),
            map: HashMap::with_capacity(capacity),
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.map.contains_key(&id.0)
    }

    pub fn lookup(&self, id: NodeId) -> Option<Slot> {
        self.map.get(&id.0).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether another node fits
    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    /// Store a node and register its id; fails on duplicate ids and when
    /// every slot is occupied
    pub fn insert(&mut self, node: Node) -> EngineResult<Slot> {
        let id = node.header.id;
        if self.map.contains_key(&id.0) {
            return Err(EngineError::NodeId(id.0));
        }
        let slot = self.free.pop().ok_or(EngineError::OutOfMemory)?;
        debug_assert!(self.slots[slot as usize].is_none());
        self.slots[slot as usize] = Some(node);
        self.map.insert(id.0, slot);
        Ok(slot)
    }

    /// Drop the id mapping, keeping the slot occupied (the node may stay
    /// alive while plugin references drain)
    pub fn remove_mapping(&mut self, id: NodeId) {
        self.map.remove(&id.0);
    }

    /// Move the node out and recycle the slot
    pub fn take(&mut self, slot: Slot) -> Node {
        let node = self.slots[slot as usize].take().expect("empty node slot");
        self.free.push(slot);
        node
    }

    pub fn node(&self, slot: Slot) -> &Node {
        self.slots[slot as usize].as_ref().expect("empty node slot")
    }

    pub fn node_mut(&mut self, slot: Slot) -> &mut Node {
        self.slots[slot as usize].as_mut().expect("empty node slot")
    }

    /// Slot of the synth node whose instance payload is `instance`
    pub fn find_by_instance(&self, instance: *mut ()) -> Option<Slot> {
        self.slots.iter().enumerate().find_map(|(slot, node)| {
            let node = node.as_ref()?;
            match &node.body {
                NodeBody::Synth(state) if state.instance() == instance => Some(slot as Slot),
                _ => None,
            }
        })
    }

    pub fn first_child(&self, slot: Slot) -> Option<Slot> {
        match &self.node(slot).body {
            NodeBody::Group(group) => group.first,
            NodeBody::Synth(_) => None,
        }
    }

    pub fn next_sibling(&self, slot: Slot) -> Option<Slot> {
        self.node(slot).header.next
    }

    /// The group a target resolves to: a group is its own enclosure, a
    /// synth resolves to its parent
    pub fn enclosing_group(&self, slot: Slot) -> Slot {
        let node = self.node(slot);
        if node.is_group() {
            slot
        } else {
            node.header.parent.expect("synth without parent")
        }
    }

    /// Attach `slot` relative to `target` according to `action`
    pub fn link(&mut self, slot: Slot, target: Slot, action: AddAction) -> EngineResult<()> {
        match action {
            AddAction::ToHead => {
                let group = self.enclosing_group(target);
                let first = self.group_mut(group).first;
                self.splice(slot, group, None, first);
            }
            AddAction::ToTail => {
                let group = self.enclosing_group(target);
                let last = self.group_mut(group).last;
                self.splice(slot, group, last, None);
            }
            AddAction::Before => {
                let target_id = self.node(target).header.id;
                let parent = self
                    .node(target)
                    .header
                    .parent
                    .ok_or(EngineError::NodeId(target_id.0))?;
                let prev = self.node(target).header.prev;
                self.splice(slot, parent, prev, Some(target));
            }
            AddAction::After => {
                let target_id = self.node(target).header.id;
                let parent = self
                    .node(target)
                    .header
                    .parent
                    .ok_or(EngineError::NodeId(target_id.0))?;
                let next = self.node(target).header.next;
                self.splice(slot, parent, Some(target), next);
            }
        }
        Ok(())
    }

    /// Insert `slot` between `prev` and `next` inside `parent`
    fn splice(&mut self, slot: Slot, parent: Slot, prev: Option<Slot>, next: Option<Slot>) {
        {
            let header = &mut self.node_mut(slot).header;
            header.parent = Some(parent);
            header.prev = prev;
            header.next = next;
        }
        match prev {
            Some(p) => self.node_mut(p).header.next = Some(slot),
            None => self.group_mut(parent).first = Some(slot),
        }
        match next {
            Some(n) => self.node_mut(n).header.prev = Some(slot),
            None => self.group_mut(parent).last = Some(slot),
        }
    }

    /// Detach `slot` from its parent and siblings
    pub fn unlink(&mut self, slot: Slot) {
        let (parent, prev, next) = {
            let header = &self.node(slot).header;
            (header.parent, header.prev, header.next)
        };
        let Some(parent) = parent else {
            return;
        };
        match prev {
            Some(p) => self.node_mut(p).header.next = next,
            None => self.group_mut(parent).first = next,
        }
        match next {
            Some(n) => self.node_mut(n).header.prev = prev,
            None => self.group_mut(parent).last = prev,
        }
        let header = &mut self.node_mut(slot).header;
        header.parent = None;
        header.prev = None;
        header.next = None;
    }

    fn group_mut(&mut self, slot: Slot) -> &mut GroupState {
        match &mut self.node_mut(slot).body {
            NodeBody::Group(group) => group,
            NodeBody::Synth(_) => panic!("node {slot} is not a group"),
        }
    }
}
