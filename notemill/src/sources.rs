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

//! # candidate sources
//!
//! Each logical origin of timeline candidates (following, recommended, trending, lists) is an
//! independent implementation of one uniform contract, [CandidateSource]. The pipeline fans out
//! one fetch per source, under a quota it computes from the source's mix ratio; everything else
//! about a source is private to it.
//!
//! Contract fine print: a source returns *at most* `max_count` notes and may return fewer;
//! ordering within a return is not promised (the pipeline re-sorts globally); a failing source is
//! worth an empty result, never a failed request — the pipeline enforces that isolation.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    config::TimelineConfig,
    entities::{AuthorId, ContentSource, Note, ViewerId},
    storage::{Error, FollowGraph, NoteStore},
};

type Result<T> = std::result::Result<T, Error>;

/// Uniform contract over one logical origin of recent notes
#[async_trait]
pub trait CandidateSource {
    fn source(&self) -> ContentSource;
    /// Recent notes from this origin for `viewer`: created after `since`, at most `max_count`.
    async fn fetch(
        &self,
        viewer: &ViewerId,
        config: &TimelineConfig,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Note>>;
}

/// The standard four sources over a note store and a follow graph
pub fn standard(
    notes: Arc<dyn NoteStore + Send + Sync>,
    graph: Arc<dyn FollowGraph + Send + Sync>,
) -> Vec<Arc<dyn CandidateSource + Send + Sync>> {
    vec![
        Arc::new(FollowingSource::new(notes.clone(), graph.clone())),
        Arc::new(RecommendedSource::new(notes.clone(), graph.clone())),
        Arc::new(TrendingSource::new(notes.clone())),
        Arc::new(ListsSource::new(notes, graph)),
    ]
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        FollowingSource                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// How long a cached follow-set stays good. Follow churn is slow relative to timeline reads, and a
/// stale set only costs a viewer one refresh interval of a new follow's notes.
const FOLLOW_SET_TTL: Duration = Duration::from_secs(600);

/// Notes authored by the members of the viewer's follow set, newest first
///
/// The follow graph is a remote service, so we keep a short-lived in-memory cache of follow-sets
/// keyed by viewer rather than hit it on every read.
pub struct FollowingSource {
    notes: Arc<dyn NoteStore + Send + Sync>,
    graph: Arc<dyn FollowGraph + Send + Sync>,
    follow_sets: Mutex<HashMap<ViewerId, (HashSet<AuthorId>, DateTime<Utc>)>>,
}

impl FollowingSource {
    pub fn new(
        notes: Arc<dyn NoteStore + Send + Sync>,
        graph: Arc<dyn FollowGraph + Send + Sync>,
    ) -> FollowingSource {
        FollowingSource {
            notes,
            graph,
            follow_sets: Mutex::new(HashMap::new()),
        }
    }
    async fn follow_set(&self, viewer: &ViewerId) -> Result<HashSet<AuthorId>> {
        let now = Utc::now();
        {
            let cache = self.follow_sets.lock().await;
            if let Some((set, fetched_at)) = cache.get(viewer) {
                if (now - *fetched_at).to_std().unwrap_or(Duration::MAX) < FOLLOW_SET_TTL {
                    return Ok(set.clone());
                }
            }
        }
        let set = self.graph.follow_set(viewer).await?;
        self.follow_sets
            .lock()
            .await
            .insert(viewer.clone(), (set.clone(), now));
        Ok(set)
    }
    /// Drop the cached follow-set; call on follow/unfollow so the next read sees the new graph
    pub async fn invalidate_follow_set(&self, viewer: &ViewerId) {
        self.follow_sets.lock().await.remove(viewer);
    }
}

#[async_trait]
impl CandidateSource for FollowingSource {
    fn source(&self) -> ContentSource {
        ContentSource::Following
    }
    async fn fetch(
        &self,
        viewer: &ViewerId,
        _config: &TimelineConfig,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Note>> {
        let follows = self.follow_set(viewer).await?;
        if follows.is_empty() {
            return Ok(Vec::new());
        }
        self.notes
            .recent_notes_by_authors(&follows, since, max_count)
            .await
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       RecommendedSource                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Overfetch factor: the recommendation pool is mined from a wider slice of recent notes than the
/// quota asks for, then whittled down.
const RECOMMENDED_POOL_FACTOR: usize = 4;

/// Notes predicted relevant to the viewer that are *not* from followed authors
///
/// The prediction here is deliberately simple (engagement rate over a recent pool); the pipeline
/// neither knows nor cares, it only holds this source to the since/max_count contract.
pub struct RecommendedSource {
    notes: Arc<dyn NoteStore + Send + Sync>,
    graph: Arc<dyn FollowGraph + Send + Sync>,
}

impl RecommendedSource {
    pub fn new(
        notes: Arc<dyn NoteStore + Send + Sync>,
        graph: Arc<dyn FollowGraph + Send + Sync>,
    ) -> RecommendedSource {
        RecommendedSource { notes, graph }
    }
}

#[async_trait]
impl CandidateSource for RecommendedSource {
    fn source(&self) -> ContentSource {
        ContentSource::Recommended
    }
    async fn fetch(
        &self,
        viewer: &ViewerId,
        _config: &TimelineConfig,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Note>> {
        let follows = self.graph.follow_set(viewer).await?;
        let pool = self
            .notes
            .recent_notes(since, max_count.saturating_mul(RECOMMENDED_POOL_FACTOR))
            .await?;
        let mut candidates: Vec<Note> = pool
            .into_iter()
            .filter(|n| !follows.contains(n.author_id()))
            .collect();
        candidates.sort_by(|a, b| {
            b.counts()
                .engagement_rate()
                .total_cmp(&a.counts().engagement_rate())
        });
        candidates.truncate(max_count);
        debug!(viewer = %viewer, count = candidates.len(), "recommended candidates");
        Ok(candidates)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        TrendingSource                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

const TRENDING_POOL_FACTOR: usize = 4;

/// Notes whose engagement velocity over the recent window is elevated; viewer-agnostic (mutes are
/// the filter's problem, downstream)
pub struct TrendingSource {
    notes: Arc<dyn NoteStore + Send + Sync>,
}

impl TrendingSource {
    pub fn new(notes: Arc<dyn NoteStore + Send + Sync>) -> TrendingSource {
        TrendingSource { notes }
    }
}

fn velocity(note: &Note, now: DateTime<Utc>) -> f64 {
    let age_hours = note.age_hours(now).max(1.0 / 60.0);
    note.counts().total_engagements() as f64 / age_hours
}

#[async_trait]
impl CandidateSource for TrendingSource {
    fn source(&self) -> ContentSource {
        ContentSource::Trending
    }
    async fn fetch(
        &self,
        _viewer: &ViewerId,
        _config: &TimelineConfig,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Note>> {
        let now = Utc::now();
        let mut pool = self
            .notes
            .recent_notes(since, max_count.saturating_mul(TRENDING_POOL_FACTOR))
            .await?;
        pool.sort_by(|a, b| velocity(b, now).total_cmp(&velocity(a, now)));
        pool.truncate(max_count);
        Ok(pool)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          ListsSource                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Notes authored by the members of the viewer's curated author lists
pub struct ListsSource {
    notes: Arc<dyn NoteStore + Send + Sync>,
    graph: Arc<dyn FollowGraph + Send + Sync>,
}

impl ListsSource {
    pub fn new(
        notes: Arc<dyn NoteStore + Send + Sync>,
        graph: Arc<dyn FollowGraph + Send + Sync>,
    ) -> ListsSource {
        ListsSource { notes, graph }
    }
}

#[async_trait]
impl CandidateSource for ListsSource {
    fn source(&self) -> ContentSource {
        ContentSource::Lists
    }
    async fn fetch(
        &self,
        viewer: &ViewerId,
        _config: &TimelineConfig,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Note>> {
        let members = self.graph.list_members(viewer).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }
        self.notes
            .recent_notes_by_authors(&members, since, max_count)
            .await
    }
}
