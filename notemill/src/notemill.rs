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

//! # application state
//!
//! [Notemill] is the shared state every handler sees, plus the write-path callbacks sibling
//! services invoke when notes & follows change.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    admission::{self, RateLimiter},
    cache::{self, RemoteKv, TimelineCache},
    config::TimelineConfig,
    entities::{AuthorId, Note, ViewerId},
    fanout::{EventKind, FanoutQueue, FanoutTask},
    metrics::Instruments,
    overdrive::Overdrive,
    pipeline::Pipeline,
    ranker::Ranker,
    sources::{CandidateSource, FollowingSource, ListsSource, RecommendedSource, TrendingSource},
    storage::{FollowGraph, NoteStore, PreferenceStore},
    streaming::SessionRegistry,
};

/// Application state available to all handlers
pub struct Notemill {
    pub pipeline: Pipeline,
    pub registry: Arc<SessionRegistry>,
    pub limiter: RateLimiter,
    pub fanout: Arc<FanoutQueue>,
    pub prefs: Arc<dyn PreferenceStore + Send + Sync>,
    pub instruments: Arc<Instruments>,
    /// The deployment's shared auth token, if one is configured
    pub shared_token: Option<String>,
    pub started_at: DateTime<Utc>,
    // Kept as a concrete type so follow events can invalidate its follow-set cache
    following_source: Arc<FollowingSource>,
}

/// Everything needed to build a [Notemill]; the daemon fills this from its config file, the test
/// crate from fixtures.
pub struct Builder {
    pub notes: Arc<dyn NoteStore + Send + Sync>,
    pub graph: Arc<dyn FollowGraph + Send + Sync>,
    pub prefs: Arc<dyn PreferenceStore + Send + Sync>,
    pub remote_cache: Option<Box<dyn RemoteKv + Send + Sync>>,
    pub overdrive: Option<Arc<dyn Overdrive + Send + Sync>>,
    pub defaults: TimelineConfig,
    pub cache_config: cache::Config,
    pub admission_config: admission::Config,
    pub fanout_config: crate::fanout::Config,
    pub shared_token: Option<String>,
}

impl Builder {
    pub fn build(self) -> Notemill {
        let instruments = Arc::new(Instruments::new("notemill"));
        let following_source =
            Arc::new(FollowingSource::new(self.notes.clone(), self.graph.clone()));
        let sources: Vec<Arc<dyn CandidateSource + Send + Sync>> = vec![
            following_source.clone(),
            Arc::new(RecommendedSource::new(self.notes.clone(), self.graph.clone())),
            Arc::new(TrendingSource::new(self.notes.clone())),
            Arc::new(ListsSource::new(self.notes.clone(), self.graph.clone())),
        ];
        let cache = Arc::new(TimelineCache::new(self.cache_config, self.remote_cache));
        let pipeline = Pipeline::new(
            sources,
            Arc::new(Ranker::new()),
            cache,
            self.notes,
            self.graph,
            self.prefs.clone(),
            self.overdrive,
            self.defaults,
        );
        Notemill {
            pipeline,
            registry: Arc::new(SessionRegistry::new()),
            limiter: RateLimiter::new(self.admission_config),
            fanout: Arc::new(FanoutQueue::new(
                self.fanout_config.queue_capacity,
                instruments.clone(),
            )),
            prefs: self.prefs,
            instruments,
            shared_token: self.shared_token,
            started_at: Utc::now(),
            following_source,
        }
    }
}

impl Notemill {
    ////////////////////////////////////////////////////////////////////////////////////////////////
    // write-path callbacks
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// A sibling service created a note; queue its fan-out. Never blocks.
    pub fn on_note_created(&self, note: Note) {
        self.fanout.submit(FanoutTask {
            note,
            kind: EventKind::Created,
        });
    }

    pub fn on_note_updated(&self, note: Note) {
        self.fanout.submit(FanoutTask {
            note,
            kind: EventKind::Updated,
        });
    }

    pub fn on_note_deleted(&self, note: Note) {
        self.fanout.submit(FanoutTask {
            note,
            kind: EventKind::Deleted,
        });
    }

    /// The follower's candidate universe just changed: drop their cached timeline & follow-set
    /// and patch the cached profile so the next request sees the new graph.
    pub async fn on_follow_event(&self, follower: &ViewerId, followee: &AuthorId, is_follow: bool) {
        debug!(follower = %follower, followee = %followee, is_follow, "follow event");
        let cache = self.pipeline.cache();
        cache.invalidate(follower).await;
        self.following_source.invalidate_follow_set(follower).await;
        if let Some(mut profile) = cache.get_profile(follower).await {
            if is_follow {
                profile.follow_set.insert(followee.clone());
            } else {
                profile.follow_set.remove(followee);
            }
            profile.last_updated = Utc::now();
            cache.put_profile(follower, profile).await;
        }
    }
}
