// Copyright (C) 2025 The notemill authors
//
// This file is part of notemill.
//
// notemill is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// notemill is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with notemill.  If not,
// see <http://www.gnu.org/licenses/>.

//! # streaming subscriptions
//!
//! Per-viewer push of incremental timeline updates. A subscriber gets a [StreamSession]: a
//! bounded pending queue, an open flag and a wait primitive. The per-viewer registry holds
//! sessions *weakly*; when a subscriber disconnects, its strong reference goes away and the map
//! entry is pruned on the next observation, so there is no cycle between the registry and the
//! sessions and no explicit unregister step.
//!
//! Delivery is best-effort, not exactly-once. Each session carries a small token bucket (five
//! messages a second): updates beyond that rate are dropped, not queued, and the drop is counted.
//! A full pending queue sheds its *oldest* update. Anything lost this way is recoverable by the
//! subscriber's next pull request.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::{
    define_metric,
    entities::{TimelineUpdate, ViewerId},
};

/// Pending updates beyond this are shed oldest-first
const PENDING_CAPACITY: usize = 64;
/// Per-session delivery budget: five messages a second, with an equal burst
const SESSION_RATE_PER_SECOND: f64 = 5.0;
const SESSION_BURST: f64 = 5.0;
/// How often an idle stream wakes up to emit a keep-alive sentinel
pub const HEARTBEAT: Duration = Duration::from_millis(500);

define_metric! { "streaming.drops", streaming_drops, Sort::IntegralCounter }
define_metric! { "streaming.sessions.opened", streaming_sessions_opened, Sort::IntegralCounter }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         StreamSession                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct SessionInner {
    pending: VecDeque<TimelineUpdate>,
    tokens: f64,
    last_refill: DateTime<Utc>,
    dropped: u64,
}

/// One subscriber connection's session state
pub struct StreamSession {
    id: Uuid,
    viewer: ViewerId,
    inner: Mutex<SessionInner>,
    notify: Notify,
    open: AtomicBool,
}

impl StreamSession {
    fn new(viewer: ViewerId, now: DateTime<Utc>) -> StreamSession {
        StreamSession {
            id: Uuid::new_v4(),
            viewer,
            inner: Mutex::new(SessionInner {
                pending: VecDeque::new(),
                tokens: SESSION_BURST,
                last_refill: now,
                dropped: 0,
            }),
            notify: Notify::new(),
            open: AtomicBool::new(true),
        }
    }
    pub fn id(&self) -> Uuid {
        self.id
    }
    pub fn viewer(&self) -> &ViewerId {
        &self.viewer
    }
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
    /// Mark the session closed; every internal wait returns promptly
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("session lock poisoned").dropped
    }

    /// Offer `update` to this session. Returns false if the session is closed or the update was
    /// shed (rate budget exhausted); sheds the oldest pending update instead of growing past the
    /// queue bound.
    pub fn push(&self, update: TimelineUpdate) -> bool {
        self.push_at(update, Utc::now())
    }

    pub fn push_at(&self, update: TimelineUpdate, now: DateTime<Utc>) -> bool {
        if !self.is_open() {
            return false;
        }
        let accepted = {
            let mut inner = self.inner.lock().expect("session lock poisoned");
            let elapsed = (now - inner.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
            inner.tokens = (inner.tokens + elapsed * SESSION_RATE_PER_SECOND).min(SESSION_BURST);
            inner.last_refill = now;
            if inner.tokens < 1.0 {
                // Over the per-session rate: drop the excess rather than queue it
                inner.dropped += 1;
                streaming_drops.add(1, &[]);
                false
            } else {
                inner.tokens -= 1.0;
                if inner.pending.len() >= PENDING_CAPACITY {
                    inner.pending.pop_front();
                    inner.dropped += 1;
                    streaming_drops.add(1, &[]);
                }
                inner.pending.push_back(update);
                true
            }
        };
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    fn pop(&self) -> Option<TimelineUpdate> {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .pending
            .pop_front()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        SessionRegistry                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The per-viewer subscription map. Holds sessions weakly; dead entries are pruned whenever a
/// viewer's list is next observed.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ViewerId, Vec<Weak<StreamSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    /// Open a session for `viewer`. The caller holds the only strong reference; dropping it is
    /// how a disconnect looks from here.
    pub fn subscribe(&self, viewer: &ViewerId) -> Arc<StreamSession> {
        let session = Arc::new(StreamSession::new(viewer.clone(), Utc::now()));
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .entry(viewer.clone())
            .or_default()
            .push(Arc::downgrade(&session));
        streaming_sessions_opened.add(1, &[]);
        debug!(viewer = %viewer, session = %session.id(), "stream session opened");
        session
    }

    /// Push `update` to every open session for `viewer`; returns how many sessions accepted it.
    /// Dead or closed sessions encountered along the way are pruned.
    pub fn push_to(&self, viewer: &ViewerId, update: &TimelineUpdate) -> usize {
        let sessions: Vec<Arc<StreamSession>> = {
            let mut map = self.sessions.lock().expect("registry lock poisoned");
            let Some(list) = map.get_mut(viewer) else {
                return 0;
            };
            list.retain(|weak| {
                weak.upgrade().map(|s| s.is_open()).unwrap_or(false)
            });
            let alive: Vec<Arc<StreamSession>> =
                list.iter().filter_map(Weak::upgrade).collect();
            if list.is_empty() {
                map.remove(viewer);
            }
            alive
        };
        sessions
            .iter()
            .filter(|session| session.push(update.clone()))
            .count()
    }

    /// Sessions currently registered (and alive) for `viewer`
    pub fn session_count(&self, viewer: &ViewerId) -> usize {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .get(viewer)
            .map(|list| list.iter().filter(|w| w.upgrade().is_some()).count())
            .unwrap_or(0)
    }

    /// Close every live session; used at server shutdown
    pub fn close_all(&self) {
        let map = self.sessions.lock().expect("registry lock poisoned");
        for session in map.values().flatten().filter_map(Weak::upgrade) {
            session.close();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         UpdateStream                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Turn a session into the subscriber-facing stream of updates.
///
/// The stream blocks on the session's queue, emits a keep-alive sentinel when nothing real has
/// flowed for a [HEARTBEAT] interval, and ends when the session closes. Dropping the stream drops
/// the last strong reference to the session, which is all a disconnect is.
pub fn into_stream(session: Arc<StreamSession>) -> impl Stream<Item = TimelineUpdate> {
    futures::stream::unfold(session, |session| async move {
        loop {
            if !session.is_open() {
                return None;
            }
            if let Some(update) = session.pop() {
                return Some((update, session));
            }
            tokio::select! {
                _ = session.notify.notified() => (),
                _ = tokio::time::sleep(HEARTBEAT) => {
                    return Some((TimelineUpdate::keep_alive(), session));
                }
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use futures::StreamExt;

    use crate::entities::{NoteId, UpdateType};

    fn t(ms: i64) -> DateTime<Utc> {
        use chrono::TimeZone;
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + chrono::Duration::milliseconds(ms)
    }

    #[test]
    fn pushes_are_fifo() {
        let session = StreamSession::new(ViewerId::from("v"), t(0));
        // Space pushes out so the rate budget never interferes
        session.push_at(TimelineUpdate::item_deleted(NoteId::from("n1")), t(0));
        session.push_at(TimelineUpdate::item_deleted(NoteId::from("n2")), t(1000));
        assert_eq!(
            session.pop().unwrap().affected_note_id,
            Some(NoteId::from("n1"))
        );
        assert_eq!(
            session.pop().unwrap().affected_note_id,
            Some(NoteId::from("n2"))
        );
    }

    #[test]
    fn rate_budget_sheds_excess() {
        let session = StreamSession::new(ViewerId::from("v"), t(0));
        // The burst allows five; the sixth within the same instant is shed
        let mut accepted = 0;
        for i in 0..6 {
            if session.push_at(TimelineUpdate::item_deleted(NoteId::from(format!("n{i}").as_str())), t(0)) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 5);
        assert_eq!(session.dropped(), 1);
        // A second later one token has come back
        assert!(session.push_at(TimelineUpdate::keep_alive(), t(1000)));
    }

    #[test]
    fn closed_sessions_refuse_pushes() {
        let session = StreamSession::new(ViewerId::from("v"), t(0));
        session.close();
        assert!(!session.push_at(TimelineUpdate::keep_alive(), t(0)));
    }

    #[test]
    fn registry_prunes_dropped_sessions_on_observation() {
        let registry = SessionRegistry::new();
        let v = ViewerId::from("v");
        let s1 = registry.subscribe(&v);
        let s2 = registry.subscribe(&v);
        assert_eq!(registry.session_count(&v), 2);
        drop(s1);
        // The dead weak is still in the list until the next observation...
        assert_eq!(
            registry.push_to(&v, &TimelineUpdate::item_deleted(NoteId::from("n"))),
            1
        );
        // ...after which only the live session remains
        assert_eq!(registry.session_count(&v), 1);
        drop(s2);
        assert_eq!(registry.push_to(&v, &TimelineUpdate::keep_alive()), 0);
        assert_eq!(registry.session_count(&v), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_delivers_then_heartbeats() {
        let registry = SessionRegistry::new();
        let v = ViewerId::from("v");
        let session = registry.subscribe(&v);
        registry.push_to(&v, &TimelineUpdate::item_deleted(NoteId::from("n1")));
        let mut stream = Box::pin(into_stream(session));
        let first = stream.next().await.unwrap();
        assert_eq!(first.update_type, UpdateType::ItemDeleted);
        // Nothing pending: the next item is a keep-alive after the heartbeat interval
        let second = stream.next().await.unwrap();
        assert_eq!(second.update_type, UpdateType::KeepAlive);
    }

    #[tokio::test]
    async fn close_ends_the_stream() {
        let registry = SessionRegistry::new();
        let v = ViewerId::from("v");
        let session = registry.subscribe(&v);
        let handle = session.clone();
        let mut stream = Box::pin(into_stream(session));
        handle.close();
        assert!(stream.next().await.is_none());
    }
}
