//! Request coalescing module
//!
//! Prevents the "thundering herd" problem by merging concurrent identical
//! requests. The first request for a cache key becomes the leader and drives
//! the upstream fetch; every later request for the same key joins the key's
//! [`CoalescingGroup`] as a waiter and receives a byte-exact replay of the
//! leader's headers and body as they arrive.
//!
//! Waiters live on their own run loops. The group never calls a waiter
//! directly: it copies the pending bytes out under its lock, releases the
//! lock, then posts one delivery task per waiter to that waiter's
//! [`ExecutionContext`].

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::response::{CachedResponse, ResponseHead};

/// Unit of work posted to a waiter's run loop
pub type DeliveryTask = Box<dyn FnOnce() + Send + 'static>;

/// A single-threaded run loop that accepts work from other threads.
pub trait ExecutionContext: Send + Sync {
    /// Queue `task` to run on this context. Must not block and must not run
    /// `task` on the caller's thread.
    fn post(&self, task: DeliveryTask);
}

/// Narrow capability a waiting request hands to a group.
///
/// The `deliver_*` methods are only invoked from tasks posted to
/// [`Waiter::execution_context`].
pub trait Waiter: Send + Sync {
    fn deliver_headers(&self, head: ResponseHead, end_stream: bool);

    fn deliver_body(&self, chunk: Bytes, end_stream: bool);

    /// The leader abandoned the fetch. Nothing else will be delivered.
    fn deliver_reset(&self);

    fn execution_context(&self) -> &dyn ExecutionContext;
}

/// Lifecycle of a group: `Empty -> HeadersSet -> Streaming -> Closed`,
/// or `Aborted` from any state before `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Empty,
    HeadersSet,
    Streaming,
    Closed,
    Aborted,
}

struct WaiterEntry {
    waiter: Arc<dyn Waiter>,
    replay_offset: usize,
    headers_delivered: bool,
    /// Terminal signal already handed out
    finished: bool,
}

struct GroupInner {
    state: GroupState,
    head: Option<ResponseHead>,
    body: BytesMut,
    waiters: Vec<WaiterEntry>,
}

/// Data copied out under the group lock, dispatched after it is released
enum Delivery {
    Replay {
        waiter: Arc<dyn Waiter>,
        head: Option<ResponseHead>,
        chunk: Option<Bytes>,
        end_stream: bool,
    },
    Reset(Arc<dyn Waiter>),
}

impl Delivery {
    fn dispatch(self) {
        match self {
            Delivery::Replay {
                waiter,
                head,
                chunk,
                end_stream,
            } => {
                let target = Arc::clone(&waiter);
                waiter
                    .execution_context()
                    .post(Box::new(move || match (head, chunk) {
                        (Some(head), None) => target.deliver_headers(head, end_stream),
                        (Some(head), Some(chunk)) => {
                            target.deliver_headers(head, false);
                            target.deliver_body(chunk, end_stream);
                        }
                        (None, Some(chunk)) => target.deliver_body(chunk, end_stream),
                        // Headers already out and no bytes left: explicit empty terminal chunk
                        (None, None) => target.deliver_body(Bytes::new(), end_stream),
                    }));
            }
            Delivery::Reset(waiter) => {
                let target = Arc::clone(&waiter);
                waiter
                    .execution_context()
                    .post(Box::new(move || target.deliver_reset()));
            }
        }
    }
}

/// Pending fan-out state for one in-flight cache key.
pub struct CoalescingGroup {
    key: String,
    inner: Mutex<GroupInner>,
}

impl CoalescingGroup {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            inner: Mutex::new(GroupInner {
                state: GroupState::Empty,
                head: None,
                body: BytesMut::new(),
                waiters: Vec::new(),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> GroupState {
        self.inner.lock().state
    }

    /// Record the response head. Only the first call has an effect.
    pub fn set_headers(&self, head: ResponseHead) -> bool {
        let mut inner = self.inner.lock();
        if inner.head.is_some() || matches!(inner.state, GroupState::Closed | GroupState::Aborted)
        {
            return false;
        }
        inner.head = Some(head);
        inner.state = if inner.body.is_empty() {
            GroupState::HeadersSet
        } else {
            GroupState::Streaming
        };
        true
    }

    /// Append to the accumulated body. Delivery happens on the next [`flush`](Self::flush).
    pub fn append_body(&self, chunk: &[u8]) {
        let mut inner = self.inner.lock();
        match inner.state {
            GroupState::Closed | GroupState::Aborted => {
                debug!(key = %self.key, len = chunk.len(), "Ignoring body for finished group");
            }
            state => {
                inner.body.extend_from_slice(chunk);
                if state == GroupState::HeadersSet {
                    inner.state = GroupState::Streaming;
                }
            }
        }
    }

    /// Register a waiter starting at offset 0.
    ///
    /// A waiter that arrives after the final flush gets the complete response
    /// replayed at once; one that arrives after an abort is reset.
    pub fn add_waiter(&self, waiter: Arc<dyn Waiter>) {
        let delivery = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match inner.state {
                GroupState::Closed => {
                    let chunk = (!inner.body.is_empty())
                        .then(|| Bytes::copy_from_slice(&inner.body));
                    inner.waiters.push(WaiterEntry {
                        waiter: Arc::clone(&waiter),
                        replay_offset: inner.body.len(),
                        headers_delivered: true,
                        finished: true,
                    });
                    Some(Delivery::Replay {
                        waiter,
                        head: inner.head.clone(),
                        chunk,
                        end_stream: true,
                    })
                }
                GroupState::Aborted => Some(Delivery::Reset(waiter)),
                _ => {
                    inner.waiters.push(WaiterEntry {
                        waiter,
                        replay_offset: 0,
                        headers_delivered: false,
                        finished: false,
                    });
                    None
                }
            }
        };

        if let Some(delivery) = delivery {
            delivery.dispatch();
        }
    }

    /// Hand every waiter the bytes it has not seen yet.
    ///
    /// Headers go out with a waiter's first delivery. With `end_stream` every
    /// waiter gets its terminal signal and the group becomes `Closed`; later
    /// flushes are no-ops. Nothing is delivered until headers are set.
    ///
    /// Flushes must be driven by a single caller (the leader) so that the
    /// tasks posted for one waiter are queued in append order.
    pub fn flush(&self, end_stream: bool) {
        let deliveries = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            if matches!(inner.state, GroupState::Closed | GroupState::Aborted) {
                return;
            }

            let Some(head) = inner.head.as_ref() else {
                debug!(key = %self.key, end_stream, "Flush before headers, nothing to deliver");
                return;
            };

            let available = inner.body.len();
            let mut deliveries = Vec::new();

            for entry in inner.waiters.iter_mut().filter(|e| !e.finished) {
                let chunk = (entry.replay_offset < available)
                    .then(|| Bytes::copy_from_slice(&inner.body[entry.replay_offset..available]));
                entry.replay_offset = available;

                let head = (!entry.headers_delivered).then(|| head.clone());
                entry.headers_delivered = true;

                if head.is_none() && chunk.is_none() && !end_stream {
                    continue;
                }
                entry.finished = end_stream;

                deliveries.push(Delivery::Replay {
                    waiter: Arc::clone(&entry.waiter),
                    head,
                    chunk,
                    end_stream,
                });
            }

            if end_stream {
                inner.state = GroupState::Closed;
            }

            deliveries
        };

        if !deliveries.is_empty() {
            debug!(
                key = %self.key,
                waiters = deliveries.len(),
                end_stream,
                "Flushing coalesced response"
            );
        }

        for delivery in deliveries {
            delivery.dispatch();
        }
    }

    /// Mark the group failed and reset every waiter still expecting data.
    /// Returns the number of waiters reset.
    pub fn abort(&self) -> usize {
        let resets: Vec<Delivery> = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, GroupState::Closed | GroupState::Aborted) {
                return 0;
            }
            inner.state = GroupState::Aborted;
            inner
                .waiters
                .iter_mut()
                .filter(|e| !e.finished)
                .map(|entry| {
                    entry.finished = true;
                    Delivery::Reset(Arc::clone(&entry.waiter))
                })
                .collect()
        };

        let count = resets.len();
        for delivery in resets {
            delivery.dispatch();
        }
        count
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn body_len(&self) -> usize {
        self.inner.lock().body.len()
    }

    /// Copy of the response accumulated so far, once headers are known.
    pub fn snapshot(&self) -> Option<CachedResponse> {
        let inner = self.inner.lock();
        let head = inner.head.clone()?;
        Some(CachedResponse::new(head, &inner.body))
    }
}

/// Result of [`GroupRegistry::try_become_leader_or_join`]
pub enum JoinOutcome {
    /// No fetch was in flight: the caller drives it through the guard.
    Leader(LeaderGuard),
    /// The waiter was registered with the in-flight group.
    Joined,
}

impl JoinOutcome {
    pub fn is_leader(&self) -> bool {
        matches!(self, JoinOutcome::Leader(_))
    }
}

/// Map from cache key to the group of the fetch currently in flight.
#[derive(Clone, Default)]
pub struct GroupRegistry {
    groups: Arc<DashMap<String, Arc<CoalescingGroup>>>,
    coalesced: Arc<AtomicU64>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically either register a new group for `key` (leader) or add
    /// `waiter` to the existing one.
    pub fn try_become_leader_or_join(&self, key: &str, waiter: Arc<dyn Waiter>) -> JoinOutcome {
        let existing = match self.groups.entry(key.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let group = Arc::new(CoalescingGroup::new(key));
                entry.insert(Arc::clone(&group));
                debug!(cache_key = %key, "Became leader for upstream fetch");
                return JoinOutcome::Leader(LeaderGuard {
                    group,
                    registry: self.clone(),
                    finished: false,
                });
            }
        };

        // The shard lock is released before touching the group lock
        existing.add_waiter(waiter);
        self.coalesced.fetch_add(1, Ordering::Relaxed);
        debug!(cache_key = %key, "Coalescing request with in-flight fetch");
        JoinOutcome::Joined
    }

    pub fn remove_group(&self, key: &str) -> bool {
        self.groups.remove(key).is_some()
    }

    /// Remove `group` only if it is still the one registered under its key.
    fn remove_if_current(&self, group: &Arc<CoalescingGroup>) -> bool {
        self.groups
            .remove_if(group.key(), |_, current| Arc::ptr_eq(current, group))
            .is_some()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CoalescingGroup>> {
        self.groups.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn stats(&self) -> CoalesceStats {
        let groups: Vec<Arc<CoalescingGroup>> = self
            .groups
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        CoalesceStats {
            in_flight_groups: groups.len(),
            total_waiters: groups.iter().map(|g| g.waiter_count()).sum(),
            coalesced_requests: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// Driving side of a group, held by the leader.
///
/// Finishing the guard flushes the terminal signal and unregisters the
/// group. Dropping it unfinished (upstream error, panic, cancelled task)
/// resets the waiters and unregisters the group so the key can be fetched
/// again.
pub struct LeaderGuard {
    group: Arc<CoalescingGroup>,
    registry: GroupRegistry,
    finished: bool,
}

impl LeaderGuard {
    pub fn key(&self) -> &str {
        self.group.key()
    }

    pub fn group(&self) -> &Arc<CoalescingGroup> {
        &self.group
    }

    pub fn set_headers(&mut self, head: ResponseHead) -> bool {
        self.group.set_headers(head)
    }

    pub fn append_body(&mut self, chunk: &[u8]) {
        self.group.append_body(chunk);
    }

    pub fn flush(&mut self) {
        self.group.flush(false);
    }

    pub fn snapshot(&self) -> Option<CachedResponse> {
        self.group.snapshot()
    }

    /// Deliver the terminal signal and retire the group. A group that never
    /// got headers cannot close, so its waiters are reset instead.
    pub fn finish(mut self) {
        self.group.flush(true);
        self.finished = true;

        if self.group.state() != GroupState::Closed {
            let reset = self.group.abort();
            self.registry.remove_if_current(&self.group);
            warn!(
                cache_key = %self.group.key(),
                waiters = reset,
                "Fetch finished without response headers, resetting coalesced waiters"
            );
            return;
        }

        self.registry.remove_if_current(&self.group);

        let waiters = self.group.waiter_count();
        if waiters > 0 {
            info!(
                cache_key = %self.group.key(),
                waiters = waiters,
                bytes = self.group.body_len(),
                "Completed coalesced fetch"
            );
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let reset = self.group.abort();
        self.registry.remove_if_current(&self.group);
        warn!(
            cache_key = %self.group.key(),
            waiters = reset,
            "Leader abandoned fetch, resetting coalesced waiters"
        );
    }
}

/// Statistics about request coalescing
#[derive(Debug, Clone, Serialize)]
pub struct CoalesceStats {
    pub in_flight_groups: usize,
    pub total_waiters: usize,
    pub coalesced_requests: u64,
}
