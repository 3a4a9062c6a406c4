// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handle binding
//!
//! A node is bound to at most one live [`Handle`]. The node keeps only a weak
//! back-reference; a bound handle holds exactly one node reference, returned
//! when the last clone of the handle is dropped.
//!
//! Transitions happen under the node lock:
//! `Unbound → Allocating → Bound → (last clone dropped) → Unbound`.
//! While the weak reference is dead but the drop has not yet cleared it the
//! binding reads as `ReclaimPending`. Callers that find the node `Allocating`
//! or `ReclaimPending` wait on the node's condition variable and retry.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::{FsError, FsResult};
use crate::mount::Mount;
use crate::node::Node;
use crate::types::{BindingState, HandleId, NodeId};

/// Waits per acquisition before giving up with `Busy`.
const MAX_BIND_RETRIES: u32 = 100;
#[cfg(not(test))]
const BIND_WAIT: Duration = Duration::from_millis(50);
#[cfg(test)]
const BIND_WAIT: Duration = Duration::from_millis(2);

#[derive(Debug)]
pub(crate) enum Binding {
    Unbound,
    Allocating,
    Bound(Weak<HandleInner>),
}

impl Binding {
    pub(crate) fn state(&self) -> BindingState {
        match self {
            Binding::Unbound => BindingState::Unbound,
            Binding::Allocating => BindingState::Allocating,
            Binding::Bound(weak) if weak.strong_count() > 0 => BindingState::Bound,
            Binding::Bound(_) => BindingState::ReclaimPending,
        }
    }
}

pub(crate) struct HandleInner {
    id: HandleId,
    generation: u64,
    node: Arc<Node>,
    mount: Mount,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        {
            let mut state = self.node.lock();
            if let Binding::Bound(weak) = &state.binding {
                assert!(
                    std::ptr::eq(weak.as_ptr(), self),
                    "node {} bound to a different handle",
                    self.node.id()
                );
            }
            state.binding = Binding::Unbound;
        }
        self.node.notify_binding();
        tracing::trace!("handle {:?} unbound from node {}", self.id, self.node.id());
        self.mount.handle_reclaimed(&self.node);
    }
}

/// External handle for a node. Clones share one binding.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.inner.node
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node.id()
    }

    /// Node generation at the time this handle was bound.
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn same_handle(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id)
            .field("node", &self.inner.node.id())
            .field("generation", &self.inner.generation)
            .finish()
    }
}

/// Return the node's handle, creating and binding one if none is live.
pub(crate) fn get_or_create(mount: &Mount, node: &Arc<Node>) -> FsResult<Handle> {
    let mut waits = 0;
    let mut state = node.lock();
    loop {
        if state.destroyed {
            return Err(FsError::NotFound);
        }
        if let Ok(dir) = state.dir() {
            if dir.parent.is_none() {
                return Err(FsError::NotFound);
            }
        }
        match &state.binding {
            Binding::Unbound => break,
            Binding::Bound(weak) => {
                if let Some(inner) = weak.upgrade() {
                    return Ok(Handle { inner });
                }
            }
            Binding::Allocating => {}
        }
        if waits == MAX_BIND_RETRIES {
            tracing::debug!("gave up waiting for handle binding on node {}", node.id());
            return Err(FsError::Busy);
        }
        waits += 1;
        state = node.wait_binding(state, BIND_WAIT);
    }

    state.binding = Binding::Allocating;
    drop(state);

    if let Err(err) = mount.acquire(node) {
        node.lock().binding = Binding::Unbound;
        node.notify_binding();
        return Err(err);
    }

    let mut state = node.lock();
    if state.ever_bound {
        state.generation += 1;
    }
    state.ever_bound = true;
    let inner = Arc::new(HandleInner {
        id: mount.next_handle_id(),
        generation: state.generation,
        node: Arc::clone(node),
        mount: mount.clone(),
    });
    state.binding = Binding::Bound(Arc::downgrade(&inner));
    drop(state);
    node.notify_binding();
    mount.handle_bound(node);
    tracing::trace!("bound handle {:?} to node {}", inner.id, node.id());
    Ok(Handle { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeSpec, Owner};
    use std::sync::Barrier;
    use std::thread;

    fn file(mount: &Mount, name: &str) -> Arc<Node> {
        mount
            .create(&mount.root(), name.as_bytes(), NodeSpec::Regular, Owner::default(), 0o644)
            .unwrap()
    }

    #[test]
    fn handle_holds_one_reference_while_bound() {
        let mount = Mount::for_tests();
        let node = file(&mount, "f");
        assert_eq!(node.refcount(), 1);
        assert_eq!(mount.binding_state(&node), BindingState::Unbound);

        let handle = mount.get_handle(&node).unwrap();
        let again = mount.get_handle(&node).unwrap();
        assert!(handle.same_handle(&again));
        assert_eq!(node.refcount(), 2);
        assert_eq!(mount.binding_state(&node), BindingState::Bound);

        drop(handle);
        assert_eq!(node.refcount(), 2);
        mount.drop_handle(again);
        assert_eq!(node.refcount(), 1);
        assert_eq!(mount.binding_state(&node), BindingState::Unbound);
    }

    #[test]
    fn rebinding_after_reclaim_bumps_generation() {
        let mount = Mount::for_tests();
        let node = file(&mount, "f");
        let first = mount.get_handle(&node).unwrap();
        let generation = first.generation();
        drop(first);
        let second = mount.get_handle(&node).unwrap();
        assert_eq!(second.generation(), generation + 1);
        assert_eq!(mount.getattr(&node).unwrap().generation, generation + 1);
    }

    #[test]
    fn concurrent_callers_share_a_single_handle() {
        let mount = Mount::for_tests();
        let node = file(&mount, "race");
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<Handle> = (0..2)
            .map(|_| {
                let mount = mount.clone();
                let node = Arc::clone(&node);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    mount.get_handle(&node).unwrap()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();

        assert!(handles[0].same_handle(&handles[1]));
        assert_eq!(node.refcount(), 2);
        assert_eq!(mount.statfs().handles, 1);
    }

    #[test]
    fn allocating_binding_reports_busy_after_bounded_waits() {
        let mount = Mount::for_tests();
        let node = file(&mount, "stuck");
        node.lock().binding = Binding::Allocating;
        assert_eq!(mount.binding_state(&node), BindingState::Allocating);
        assert!(matches!(mount.get_handle(&node), Err(FsError::Busy)));
        node.lock().binding = Binding::Unbound;
        assert!(mount.get_handle(&node).is_ok());
    }

    #[test]
    fn removed_directory_cannot_get_a_handle() {
        let mount = Mount::for_tests();
        let root = mount.root();
        let dir = mount
            .create(&root, b"d", NodeSpec::Directory, Owner::default(), 0o755)
            .unwrap();
        mount.rmdir(&root, b"d").unwrap();
        assert!(matches!(mount.get_handle(&dir), Err(FsError::NotFound)));
    }

    #[test]
    fn handle_keeps_unlinked_file_alive_until_dropped() {
        let mount = Mount::for_tests();
        let root = mount.root();
        let node = file(&mount, "tmp");
        mount.write(&node, 0, b"payload").unwrap();
        let handle = mount.get_handle(&node).unwrap();
        mount.unlink(&root, b"tmp").unwrap();

        assert!(!node.is_destroyed());
        assert_eq!(mount.statfs().data_pages, 1);
        let mut buf = [0u8; 7];
        mount.read(handle.node(), 0, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");

        drop(handle);
        assert!(node.is_destroyed());
        assert_eq!(mount.statfs().data_pages, 0);
        assert!(matches!(mount.get_handle(&node), Err(FsError::NotFound)));
    }
}
