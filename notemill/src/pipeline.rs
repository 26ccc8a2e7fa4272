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

//! # the timeline pipeline
//!
//! Orchestrates the candidate sources, the filter, the ranker & the cache into one read path:
//!
//! 1. resolve the effective config (defaults ∪ stored preferences ∪ per-request overrides);
//! 2. probe the result cache; a hit serves the page directly;
//! 3. on a miss, fan out one fetch per source under its quota, each with a soft deadline;
//! 4. dedupe by note id (lower source ordinal wins), filter, score;
//! 5. walk the scored slate enforcing per-source caps & the score threshold;
//! 6. optionally hand the slate to the external heavy ranker;
//! 7. write back through the cache and paginate.
//!
//! Failure philosophy, in one line per collaborator: a source failure is an empty source; a
//! ranker failure falls back to chronological; a filter failure fails the request closed; a
//! remote-cache failure is the cache module's secret.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{
    cache::TimelineCache,
    config::{self, Algorithm, RequestOverrides, TimelineConfig, TimelinePreferences},
    define_metric,
    entities::{
        ContentSource, EngagementAction, Note, NoteId, RankedItem, ViewerId, ViewerProfile,
    },
    filter::{self, ContentFilter},
    overdrive::Overdrive,
    ranker::Ranker,
    sources::CandidateSource,
    storage::{self, FollowGraph, NoteStore, PreferenceStore},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Request deadline expired before any candidate source returned"))]
    DeadlineExceeded { backtrace: Backtrace },
    #[snafu(display("Content filtering failed; refusing to serve unfiltered content: {source}"))]
    FilterFailed { source: filter::Error },
    #[snafu(display("Follow graph unreachable and no cached profile for {viewer}: {source}"))]
    GraphUnavailable {
        viewer: ViewerId,
        source: storage::Error,
    },
    #[snafu(display("Preference store failed for {viewer}: {source}"))]
    Preferences {
        viewer: ViewerId,
        source: storage::Error,
    },
    #[snafu(display("Note {note} is unknown to the note store"))]
    UnknownNote { note: NoteId, backtrace: Backtrace },
    #[snafu(display("Note store lookup failed: {source}"))]
    NoteLookup { source: storage::Error },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      pages & metadata                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct PageMetadata {
    pub algorithm: Algorithm,
    pub weights: config::SignalWeights,
    pub total_items: usize,
    pub new_items_since_last_fetch: usize,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
    pub total_count: usize,
    pub has_next: bool,
}

/// One paginated slice of an assembled timeline
#[derive(Clone, Debug, PartialEq)]
pub struct TimelinePage {
    pub items: Vec<RankedItem>,
    pub metadata: PageMetadata,
    pub pagination: Pagination,
}

/// Per-request paging controls, already validated by the caller
#[derive(Clone, Copy, Debug, Default)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the pipeline                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

define_metric! { "pipeline.requests", pipeline_requests, Sort::IntegralCounter }
define_metric! { "pipeline.cache.hits", pipeline_cache_hits, Sort::IntegralCounter }
define_metric! { "pipeline.cache.misses", pipeline_cache_misses, Sort::IntegralCounter }
define_metric! { "pipeline.source.failures", pipeline_source_failures, Sort::IntegralCounter }
define_metric! { "pipeline.ranker.fallbacks", pipeline_ranker_fallbacks, Sort::IntegralCounter }

/// The default request budget; callers may carry a shorter one
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
/// A source gets this share of whatever budget remains when its fetch starts
const SOFT_DEADLINE_SHARE: f64 = 0.4;

pub struct Pipeline {
    sources: Vec<Arc<dyn CandidateSource + Send + Sync>>,
    filter: ContentFilter,
    ranker: Arc<Ranker>,
    cache: Arc<TimelineCache>,
    notes: Arc<dyn NoteStore + Send + Sync>,
    graph: Arc<dyn FollowGraph + Send + Sync>,
    prefs: Arc<dyn PreferenceStore + Send + Sync>,
    overdrive: Option<Arc<dyn Overdrive + Send + Sync>>,
    defaults: TimelineConfig,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sources: Vec<Arc<dyn CandidateSource + Send + Sync>>,
        ranker: Arc<Ranker>,
        cache: Arc<TimelineCache>,
        notes: Arc<dyn NoteStore + Send + Sync>,
        graph: Arc<dyn FollowGraph + Send + Sync>,
        prefs: Arc<dyn PreferenceStore + Send + Sync>,
        overdrive: Option<Arc<dyn Overdrive + Send + Sync>>,
        defaults: TimelineConfig,
    ) -> Pipeline {
        Pipeline {
            sources,
            filter: ContentFilter::new(),
            ranker,
            cache,
            notes,
            graph,
            prefs,
            overdrive,
            defaults,
        }
    }

    pub fn ranker(&self) -> &Arc<Ranker> {
        &self.ranker
    }
    pub fn cache(&self) -> &Arc<TimelineCache> {
        &self.cache
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // config resolution
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// defaults ∪ stored viewer preferences ∪ per-request overrides. A preference-store failure
    /// is absorbed (the viewer gets defaults); it costs personalization, not availability.
    pub async fn resolve_config(
        &self,
        viewer: &ViewerId,
        overrides: &RequestOverrides,
    ) -> TimelineConfig {
        let prefs = match self.prefs.preferences(viewer).await {
            Ok(prefs) => prefs,
            Err(err) => {
                warn!(viewer = %viewer, "preference load failed; using defaults: {err}");
                None
            }
        };
        config::resolve(&self.defaults, prefs.as_ref(), overrides)
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // profiles
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// The viewer's profile, created with defaults on first sight. The follow graph & mute state
    /// are loaded fresh when the cache has nothing; an unreachable follow graph with no cached
    /// fallback is an `UNAVAILABLE` for the whole request.
    pub async fn get_or_create_profile(&self, viewer: &ViewerId) -> Result<ViewerProfile> {
        if let Some(profile) = self.cache.get_profile(viewer).await {
            return Ok(profile);
        }
        let now = Utc::now();
        let mut profile = ViewerProfile::defaulted(viewer.clone(), now);
        profile.follow_set = self
            .graph
            .follow_set(viewer)
            .await
            .context(GraphUnavailableSnafu {
                viewer: viewer.clone(),
            })?;
        // Mute state feeds the safety filter; failing to load it fails closed upstream.
        let mutes = self
            .prefs
            .mute_state(viewer)
            .await
            .context(PreferencesSnafu {
                viewer: viewer.clone(),
            })?;
        profile.muted_users = mutes.muted_users;
        profile.muted_keywords = mutes.muted_keywords;
        profile.nsfw_opt_in = mutes.nsfw_opt_in;
        profile.engaged_hashtags = self.ranker.engaged_hashtags(viewer);
        self.cache.put_profile(viewer, profile.clone()).await;
        debug!(viewer = %viewer, "created viewer profile with defaults");
        Ok(profile)
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // assembly
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Assemble a ranked timeline from scratch (no cache involvement). `since` bounds candidate
    /// age; `deadline` is the absolute request budget.
    pub async fn assemble(
        &self,
        viewer: &ViewerId,
        config: &TimelineConfig,
        since: DateTime<Utc>,
        deadline: DateTime<Utc>,
        use_overdrive: bool,
    ) -> Result<Vec<RankedItem>> {
        let profile = self.get_or_create_profile(viewer).await?;

        let tagged = self.fetch_candidates(viewer, config, since, deadline).await?;

        // Safety filtering fails closed: an error here is the one collaborator failure that takes
        // the whole request down.
        let (notes, sources): (Vec<Note>, Vec<(NoteId, ContentSource)>) = (
            tagged.iter().map(|(n, _)| n.clone()).collect(),
            tagged
                .iter()
                .map(|(n, s)| (n.id().clone(), *s))
                .collect(),
        );
        let kept = self
            .filter
            .filter(notes, viewer, &profile)
            .context(FilterFailedSnafu)?;
        let source_of: HashMap<NoteId, ContentSource> = sources.into_iter().collect();
        let kept: Vec<(Note, ContentSource)> = kept
            .into_iter()
            .map(|note| {
                let source = source_of[note.id()];
                (note, source)
            })
            .collect();

        let now = Utc::now();
        let scored = match self
            .ranker
            .score(kept.clone(), viewer, &profile, config, now)
        {
            Ok(scored) => scored,
            Err(err) => {
                // Ranker trouble is not worth an error page; serve time-ordered instead.
                warn!(viewer = %viewer, "ranker failed ({err}); falling back to chronological");
                pipeline_ranker_fallbacks.add(1, &[]);
                Ranker::chronological(kept, now)
            }
        };

        let mut slate = enforce_caps(scored, config);

        if use_overdrive {
            self.rerank(viewer, &mut slate).await;
        }
        Ok(slate)
    }

    /// One fetch per source under its quota, in parallel, each behind a soft deadline of
    /// [SOFT_DEADLINE_SHARE] of the remaining request budget. A slow or failing source
    /// contributes nothing; only a total wipeout past the deadline is an error.
    async fn fetch_candidates(
        &self,
        viewer: &ViewerId,
        config: &TimelineConfig,
        since: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<(Note, ContentSource)>> {
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let soft_deadline = remaining.mul_f64(SOFT_DEADLINE_SHARE);

        let mut fetches: JoinSet<(ContentSource, Option<Vec<Note>>)> = JoinSet::new();
        let mut attempted = 0usize;
        for source in &self.sources {
            let quota = config.quota(source.source());
            if quota == 0 {
                continue;
            }
            attempted += 1;
            let source = source.clone();
            let viewer = viewer.clone();
            let config = config.clone();
            fetches.spawn(async move {
                let kind = source.source();
                match tokio::time::timeout(
                    soft_deadline,
                    source.fetch(&viewer, &config, since, quota),
                )
                .await
                {
                    Ok(Ok(notes)) => (kind, Some(notes)),
                    Ok(Err(err)) => {
                        warn!(source = %kind, "candidate source failed (treating as empty): {err}");
                        pipeline_source_failures.add(1, &[]);
                        (kind, None)
                    }
                    Err(_) => {
                        warn!(source = %kind, "candidate source exceeded its soft deadline");
                        pipeline_source_failures.add(1, &[]);
                        (kind, None)
                    }
                }
            });
        }

        let mut by_source: HashMap<ContentSource, Vec<Note>> = HashMap::new();
        let mut any_returned = false;
        while let Some(joined) = fetches.join_next().await {
            if let Ok((kind, notes)) = joined {
                if let Some(notes) = notes {
                    any_returned = true;
                    debug!(source = %kind, count = notes.len(), "fetched candidates");
                    by_source.insert(kind, notes);
                }
            }
        }

        if attempted > 0 && !any_returned && Utc::now() >= deadline {
            return DeadlineExceededSnafu.fail();
        }

        // Merge in ordinal order & dedupe by note id; the first occurrence wins, so FOLLOWING
        // beats RECOMMENDED on conflict and so on down the ordinals.
        let mut seen: HashSet<NoteId> = HashSet::new();
        let mut tagged: Vec<(Note, ContentSource)> = Vec::new();
        for kind in ContentSource::ALL {
            for note in by_source.remove(&kind).unwrap_or_default() {
                if seen.insert(note.id().clone()) {
                    tagged.push((note, kind));
                }
            }
        }
        Ok(tagged)
    }

    /// The optional external re-rank: replace `final_score` for ids the heavy ranker scored,
    /// leave the rest untouched, then re-sort stably so unmatched ids keep their relative order.
    async fn rerank(&self, viewer: &ViewerId, slate: &mut Vec<RankedItem>) {
        let Some(ref overdrive) = self.overdrive else {
            return;
        };
        if !overdrive.is_available().await {
            debug!("overdrive not available; serving local ranking");
            return;
        }
        let candidates: Vec<NoteId> = slate.iter().map(|item| item.note.id().clone()).collect();
        match overdrive
            .rank_for_you(viewer, &candidates, candidates.len())
            .await
        {
            Ok(scores) => {
                let scores: HashMap<NoteId, f64> = scores.into_iter().collect();
                for item in slate.iter_mut() {
                    if let Some(score) = scores.get(item.note.id()) {
                        item.final_score = score.max(0.0);
                        item.injection_reason = "overdrive".to_owned();
                    }
                }
                slate.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
            }
            Err(err) => {
                warn!(viewer = %viewer, "overdrive re-rank failed (keeping local scores): {err}");
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // the read entry points
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// The general read path: cache probe, assemble on miss, write back, paginate.
    pub async fn get_timeline(
        &self,
        viewer: &ViewerId,
        config: &TimelineConfig,
        page: PageRequest,
        deadline: DateTime<Utc>,
        use_overdrive: bool,
    ) -> Result<TimelinePage> {
        pipeline_requests.add(1, &[]);
        let items = match self.cache.get(viewer).await {
            Some(items) => {
                pipeline_cache_hits.add(1, &[]);
                debug!(viewer = %viewer, count = items.len(), "timeline cache hit");
                items
            }
            None => {
                pipeline_cache_misses.add(1, &[]);
                let since = Utc::now() - chrono::Duration::hours(config.max_age_hours);
                let items = self
                    .assemble(viewer, config, since, deadline, use_overdrive)
                    .await?;
                self.cache.put(viewer, items.clone(), None).await;
                info!(viewer = %viewer, count = items.len(), "assembled timeline");
                items
            }
        };
        Ok(self.page(viewer, config, items, page).await)
    }

    /// Force-regenerate: invalidate the cache and return only items newer than `since`. The
    /// partial slate is deliberately not written back.
    pub async fn refresh(
        &self,
        viewer: &ViewerId,
        config: &TimelineConfig,
        since: DateTime<Utc>,
        max_items: usize,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<RankedItem>> {
        self.cache.invalidate(viewer).await;
        let mut config = config.clone();
        config.max_items = max_items;
        let mut items = self.assemble(viewer, &config, since, deadline, false).await?;
        items.retain(|item| item.note.created_at() > since);
        Ok(items)
    }

    async fn page(
        &self,
        viewer: &ViewerId,
        config: &TimelineConfig,
        items: Vec<RankedItem>,
        page: PageRequest,
    ) -> TimelinePage {
        let total = items.len();
        let last_read = self.cache.get_last_read(viewer).await;
        let new_items = items
            .iter()
            .filter(|item| item.injected_at > last_read)
            .count();
        let offset = std::cmp::min(page.offset, total);
        let end = std::cmp::min(offset + page.limit, total);
        let slice = items[offset..end].to_vec();
        TimelinePage {
            items: slice,
            metadata: PageMetadata {
                algorithm: config.algorithm,
                weights: config.weights,
                total_items: total,
                new_items_since_last_fetch: new_items,
                last_updated: Utc::now(),
            },
            pagination: Pagination {
                offset: page.offset,
                limit: page.limit,
                total_count: total,
                has_next: page.offset + page.limit < total,
            },
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // write-side entry points
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Record one engagement event: ranker state, then the cached profile. Errors surface to the
    /// caller; the pipeline's own state is never left half-updated (the ranker write is atomic
    /// under its lock, and the profile write is last).
    pub async fn record_engagement(
        &self,
        viewer: &ViewerId,
        note_id: &NoteId,
        action: EngagementAction,
        duration_seconds: f64,
    ) -> Result<()> {
        let note = self
            .notes
            .note(note_id)
            .await
            .context(NoteLookupSnafu)?
            .ok_or_else(|| {
                UnknownNoteSnafu {
                    note: note_id.clone(),
                }
                .build()
            })?;
        let now = Utc::now();
        self.ranker
            .record_engagement(viewer, &note, action, duration_seconds, now);
        let mut profile = self.get_or_create_profile(viewer).await?;
        profile
            .engaged_hashtags
            .extend(note.hashtags().iter().cloned());
        if let Some(affinity) = self.ranker.affinity(viewer, note.author_id()) {
            profile
                .author_affinity
                .insert(note.author_id().clone(), affinity);
        }
        profile.last_updated = now;
        self.cache.put_profile(viewer, profile).await;
        debug!(viewer = %viewer, note = %note_id, action = %action, "recorded engagement");
        Ok(())
    }

    pub async fn mark_read(&self, viewer: &ViewerId, read_until: DateTime<Utc>) {
        self.cache.set_last_read(viewer, read_until).await;
    }
}

/// Walk the score-sorted slate keeping per-source counters; skip items whose source is at its
/// cap, stop at `max_items` or once scores drop under the threshold.
fn enforce_caps(items: Vec<RankedItem>, config: &TimelineConfig) -> Vec<RankedItem> {
    let mut counts: HashMap<ContentSource, usize> = HashMap::new();
    let mut kept = Vec::new();
    for item in items {
        if kept.len() >= config.max_items {
            break;
        }
        if item.final_score < config.min_score_threshold {
            break; // score-sorted, so nothing after this passes either
        }
        let count = counts.entry(item.source).or_insert(0);
        if *count >= config.effective_cap(item.source) {
            continue;
        }
        *count += 1;
        kept.push(item);
    }
    kept
}

#[cfg(test)]
mod test {
    use super::*;

    use async_trait::async_trait;

    use crate::{
        cache,
        entities::{AuthorId, RankingSignals},
        sources,
        storage::Memory,
    };

    fn t(minutes_ago: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(minutes_ago)
    }

    fn deadline() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(30)
    }

    async fn pipeline_over(mem: Arc<Memory>) -> Pipeline {
        Pipeline::new(
            sources::standard(mem.clone(), mem.clone()),
            Arc::new(Ranker::new()),
            Arc::new(TimelineCache::new(cache::Config::default(), None)),
            mem.clone(),
            mem.clone(),
            mem.clone(),
            None,
            TimelineConfig::default(),
        )
    }

    fn mk_item(id: &str, author: &str, source: ContentSource, score: f64) -> RankedItem {
        RankedItem {
            note: Note::new(NoteId::from(id), AuthorId::from(author), "x", t(1)),
            source,
            final_score: score,
            signals: RankingSignals::default(),
            injected_at: Utc::now(),
            injection_reason: source.to_string(),
        }
    }

    #[test]
    fn caps_bound_each_source() {
        let mut config = TimelineConfig::default();
        config.max_items = 10;
        config.caps.following = 2;
        let items: Vec<RankedItem> = (0..5)
            .map(|i| mk_item(&format!("f{i}"), "a", ContentSource::Following, 0.9))
            .chain((0..5).map(|i| mk_item(&format!("r{i}"), "b", ContentSource::Recommended, 0.8)))
            .collect();
        let kept = enforce_caps(items, &config);
        let following = kept
            .iter()
            .filter(|i| i.source == ContentSource::Following)
            .count();
        assert_eq!(following, 2);
        assert_eq!(kept.len(), 7);
    }

    #[test]
    fn threshold_stops_the_walk() {
        let config = TimelineConfig::default(); // threshold 0.1
        let items = vec![
            mk_item("n1", "a", ContentSource::Following, 0.5),
            mk_item("n2", "a", ContentSource::Following, 0.05),
            mk_item("n3", "a", ContentSource::Following, 0.4),
        ];
        // Items arrive score-sorted in production; the walk stops at the first sub-threshold one
        let kept = enforce_caps(items, &config);
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn dedupe_prefers_the_lower_source_ordinal() {
        // "N2" reachable both via following & recommended; the assembled timeline must carry it
        // once, attributed to FOLLOWING.
        let mem = Arc::new(Memory::new());
        let v = ViewerId::from("v");
        mem.add_follow(&v, &AuthorId::from("a")).await;
        mem.add_note(Note::new(NoteId::from("n1"), AuthorId::from("a"), "one", t(10))).await;
        mem.add_note(Note::new(NoteId::from("n2"), AuthorId::from("a"), "two", t(5))).await;
        mem.add_note(Note::new(NoteId::from("n3"), AuthorId::from("b"), "three", t(7))).await;
        let p = pipeline_over(mem).await;
        let config = TimelineConfig::default();
        let items = p
            .assemble(&v, &config, t(60), deadline(), false)
            .await
            .unwrap();
        let n2: Vec<&RankedItem> = items
            .iter()
            .filter(|i| i.note.id().as_str() == "n2")
            .collect();
        assert_eq!(n2.len(), 1);
        assert_eq!(n2[0].source, ContentSource::Following);
        // No duplicate ids anywhere
        let mut ids: Vec<&str> = items.iter().map(|i| i.note.id().as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), items.len());
    }

    #[tokio::test]
    async fn empty_sources_mean_an_empty_timeline_not_an_error() {
        let mem = Arc::new(Memory::new());
        let p = pipeline_over(mem).await;
        let page = p
            .get_timeline(
                &ViewerId::from("v"),
                &TimelineConfig::default(),
                PageRequest { offset: 0, limit: 20 },
                deadline(),
                false,
            )
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert!(!page.pagination.has_next);
    }

    #[tokio::test]
    async fn offset_past_the_end_is_empty_not_an_error() {
        let mem = Arc::new(Memory::new());
        let v = ViewerId::from("v");
        mem.add_follow(&v, &AuthorId::from("a")).await;
        mem.add_note(Note::new(NoteId::from("n1"), AuthorId::from("a"), "hi there", t(1))).await;
        let p = pipeline_over(mem).await;
        let page = p
            .get_timeline(
                &v,
                &TimelineConfig::default(),
                PageRequest { offset: 99, limit: 20 },
                deadline(),
                false,
            )
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.pagination.total_count, 1);
        assert!(!page.pagination.has_next);
    }

    #[tokio::test]
    async fn limit_zero_reports_has_next() {
        let mem = Arc::new(Memory::new());
        let v = ViewerId::from("v");
        mem.add_follow(&v, &AuthorId::from("a")).await;
        mem.add_note(Note::new(NoteId::from("n1"), AuthorId::from("a"), "hi there", t(1))).await;
        let p = pipeline_over(mem).await;
        let page = p
            .get_timeline(
                &v,
                &TimelineConfig::default(),
                PageRequest { offset: 0, limit: 0 },
                deadline(),
                false,
            )
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert!(page.pagination.has_next);
    }

    #[tokio::test]
    async fn cache_hit_serves_without_reassembly() {
        let mem = Arc::new(Memory::new());
        let v = ViewerId::from("v");
        mem.add_follow(&v, &AuthorId::from("a")).await;
        mem.add_note(Note::new(NoteId::from("n1"), AuthorId::from("a"), "hi there", t(1))).await;
        let p = pipeline_over(mem.clone()).await;
        let config = TimelineConfig::default();
        let page_req = PageRequest { offset: 0, limit: 20 };
        let first = p
            .get_timeline(&v, &config, page_req, deadline(), false)
            .await
            .unwrap();
        // A note created after assembly is invisible until the cache is invalidated
        mem.add_note(Note::new(NoteId::from("n2"), AuthorId::from("a"), "again", t(0))).await;
        let second = p
            .get_timeline(&v, &config, page_req, deadline(), false)
            .await
            .unwrap();
        assert_eq!(first.items, second.items);
    }

    #[tokio::test]
    async fn refresh_returns_only_newer_items() {
        let mem = Arc::new(Memory::new());
        let v = ViewerId::from("v");
        mem.add_follow(&v, &AuthorId::from("a")).await;
        mem.add_note(Note::new(NoteId::from("old"), AuthorId::from("a"), "old note", t(120))).await;
        mem.add_note(Note::new(NoteId::from("new"), AuthorId::from("a"), "new note", t(5))).await;
        let p = pipeline_over(mem).await;
        let items = p
            .refresh(&v, &TimelineConfig::default(), t(30), 20, deadline())
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].note.id().as_str(), "new");
        // and the viewer's cache is gone
        assert!(p.cache().get(&v).await.is_none());
    }

    #[tokio::test]
    async fn mutes_remove_candidates() {
        let mem = Arc::new(Memory::new());
        let v = ViewerId::from("v");
        mem.add_follow(&v, &AuthorId::from("a")).await;
        mem.add_follow(&v, &AuthorId::from("b")).await;
        mem.add_muted_user(&v, &AuthorId::from("a")).await.unwrap();
        mem.add_note(Note::new(NoteId::from("n1"), AuthorId::from("a"), "muted away", t(5))).await;
        mem.add_note(Note::new(NoteId::from("n2"), AuthorId::from("b"), "kept here", t(5))).await;
        let p = pipeline_over(mem).await;
        let items = p
            .assemble(&v, &TimelineConfig::default(), t(60), deadline(), false)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].note.id().as_str(), "n2");
    }

    /// An overdrive stub that inverts whatever order it is given
    struct Inverter;

    #[async_trait]
    impl Overdrive for Inverter {
        async fn rank_for_you(
            &self,
            _viewer: &ViewerId,
            candidates: &[NoteId],
            _limit: usize,
        ) -> std::result::Result<Vec<(NoteId, f64)>, crate::overdrive::Error> {
            Ok(candidates
                .iter()
                .enumerate()
                .map(|(rank, id)| (id.clone(), rank as f64 + 1.0))
                .collect())
        }
        async fn is_available(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn overdrive_scores_replace_and_resort() {
        let mem = Arc::new(Memory::new());
        let v = ViewerId::from("v");
        mem.add_follow(&v, &AuthorId::from("a")).await;
        mem.add_note(Note::new(NoteId::from("n1"), AuthorId::from("a"), "first note here", t(5))).await;
        mem.add_note(Note::new(NoteId::from("n2"), AuthorId::from("a"), "second note here", t(50))).await;
        let mut p = pipeline_over(mem).await;
        p.overdrive = Some(Arc::new(Inverter));
        let items = p
            .assemble(&v, &TimelineConfig::default(), t(60), deadline(), true)
            .await
            .unwrap();
        // The inverter hands the bottom item the top score
        assert_eq!(items.first().unwrap().injection_reason, "overdrive");
        assert!(items.first().unwrap().final_score >= items.last().unwrap().final_score);
    }
}
