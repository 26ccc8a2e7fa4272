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

//! # ranker
//!
//! ## Introduction
//!
//! The ranker assigns every candidate a scalar score and then reshapes the batch for diversity,
//! novelty & repetition control. Scoring is a weighted sum of five signals, each normalized to
//! [0, 1]:
//!
//! | signal | what it measures |
//! |---|---|
//! | author_affinity | how much this viewer has historically cared about this author |
//! | content_quality | heuristics over the note itself (length, media, tags, spammy tells) |
//! | engagement_velocity | engagements per hour since creation, normalized |
//! | recency | exponential decay with a six-hour half-life |
//! | personalization | topical & temporal match to the viewer |
//!
//! "ML-style" is doing some work in that sentence: these are hand-tuned heuristics with the
//! *shape* of a learned scorer (named signals, per-signal weights, an online-updated affinity
//! table). Swapping in a model later changes this module's internals, not its contract.
//!
//! ## Shaping
//!
//! After the weighted sum, three passes run in a fixed order: batch-level diversity shaping
//! (scaled by the config's diversity weight), emission-order repetition control, and (under the
//! hybrid algorithm only) a freshness/discovery micro-boost. Scores are clamped at zero and the
//! batch is sorted score-descending with deterministic tie-breaks.
//!
//! ## State & locking
//!
//! The ranker's affinity tables are the only mutable state in this module, guarded by one
//! dedicated lock. Reads (scoring) take it briefly to copy what they need; writes (engagement
//! recording) are the only mutators. The lock is a plain [std::sync::Mutex]: it is never held
//! across an await.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use chrono::{DateTime, Timelike, Utc};
use snafu::Snafu;
use tracing::debug;

use crate::{
    config::{Algorithm, TimelineConfig},
    entities::{
        AuthorId, ContentSource, EngagementAction, Note, NoteId, RankedItem, RankingSignals,
        ViewerId, ViewerProfile,
    },
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Ranking failed for {viewer}: {reason}"))]
    Ranking { viewer: ViewerId, reason: String },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       scoring constants                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

const BASE_AFFINITY_FOLLOWED: f64 = 0.8;
const BASE_AFFINITY_STRANGER: f64 = 0.1;
const GLOBAL_SCORE_WEIGHT: f64 = 0.2;

const QUALITY_BASE: f64 = 0.5;
const QUALITY_TEXT_LENGTH_BOOST: f64 = 0.1;
const QUALITY_MEDIA_BOOST: f64 = 0.15;
const QUALITY_HASHTAG_BOOST: f64 = 0.08;
const QUALITY_MENTION_BOOST: f64 = 0.12;
const QUALITY_LINK_PENALTY: f64 = 0.05;
const QUALITY_TAG_SPAM_PENALTY: f64 = 0.1;
const QUALITY_SHORT_TEXT_PENALTY: f64 = 0.2;
const QUALITY_ENGAGEMENT_CAP: f64 = 0.3;

const VELOCITY_NORMALIZER: f64 = 10.0;
const RECENCY_HALF_LIFE_HOURS: f64 = 6.0;

const PERSONALIZATION_WEIGHT: f64 = 0.1;
const ACTIVE_HOUR_BOOST: f64 = 0.1;
const ENGAGED_HASHTAG_BOOST: f64 = 0.05;
// The stand-in for per-viewer activity learning: most people are awake 09:00-23:00.
const ACTIVE_HOURS: std::ops::RangeInclusive<u32> = 9..=23;

const DIVERSITY_AUTHOR_ALLOWANCE: usize = 3;
const DIVERSITY_AUTHOR_PENALTY: f64 = 0.05;
const SINGLETON_HASHTAG_BOOST: f64 = 0.02;

const REPETITION_SOFT_CAP: usize = 2;
const REPETITION_PENALTY_STEP: f64 = 0.06;
const BACK_TO_BACK_PENALTY: f64 = 0.05;
const HASHTAG_SATURATION_THRESHOLD: usize = 4;
const HASHTAG_SATURATION_PENALTY: f64 = 0.01;

const HYBRID_FRESHNESS_BOOST: f64 = 0.02;
const HYBRID_DISCOVERY_BOOST: f64 = 0.01;
const HYBRID_FRESHNESS_WINDOW_MINUTES: i64 = 30;

const GLOBAL_AUTHOR_STEP: f64 = 0.01;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         affinity state                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
struct AffinityState {
    viewer_author: HashMap<ViewerId, HashMap<AuthorId, f64>>,
    engaged_hashtags: HashMap<ViewerId, HashSet<String>>,
    global_author: HashMap<AuthorId, f64>,
    last_engagement: HashMap<ViewerId, DateTime<Utc>>,
}

/// What the scorer needs out of the affinity tables for one viewer; copied under the lock so the
/// lock isn't held while scoring
struct AffinityView {
    author: HashMap<AuthorId, f64>,
    hashtags: HashSet<String>,
    global_author: HashMap<AuthorId, f64>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Ranker                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Multi-signal scorer with diversity/novelty/repetition shaping
#[derive(Debug, Default)]
pub struct Ranker {
    state: Mutex<AffinityState>,
}

impl Ranker {
    pub fn new() -> Ranker {
        Ranker::default()
    }

    /// Score `notes` (already tagged with the source that produced each) for `viewer`.
    ///
    /// Under [Algorithm::Chronological] scoring short-circuits: the score is the creation time in
    /// epoch seconds and the shaping passes are skipped entirely.
    pub fn score(
        &self,
        notes: Vec<(Note, ContentSource)>,
        viewer: &ViewerId,
        profile: &ViewerProfile,
        config: &TimelineConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedItem>> {
        if config.algorithm == Algorithm::Chronological {
            return Ok(Self::chronological(notes, now));
        }

        let view = {
            let state = self.state.lock().expect("affinity lock poisoned");
            AffinityView {
                author: state.viewer_author.get(viewer).cloned().unwrap_or_default(),
                hashtags: {
                    let mut tags = state
                        .engaged_hashtags
                        .get(viewer)
                        .cloned()
                        .unwrap_or_default();
                    tags.extend(profile.engaged_hashtags.iter().cloned());
                    tags
                },
                global_author: state.global_author.clone(),
            }
        };

        debug!(viewer = %viewer, candidates = notes.len(), "scoring slate");

        let mut items: Vec<RankedItem> = notes
            .into_iter()
            .map(|(note, source)| {
                let signals = RankingSignals {
                    author_affinity: author_affinity(&note, profile, &view),
                    content_quality: content_quality(&note),
                    engagement_velocity: engagement_velocity(&note, now),
                    recency: recency(&note, now),
                    personalization: personalization(&note, &view),
                };
                let final_score = signals.author_affinity * config.weights.author_affinity
                    + signals.content_quality * config.weights.content_quality
                    + signals.engagement_velocity * config.weights.engagement
                    + signals.recency * config.weights.recency
                    + signals.personalization * PERSONALIZATION_WEIGHT;
                RankedItem {
                    injection_reason: source.to_string(),
                    note,
                    source,
                    final_score,
                    signals,
                    injected_at: now,
                }
            })
            .collect();

        apply_diversity_shaping(&mut items, config.weights.diversity);
        apply_repetition_control(&mut items);
        if config.algorithm == Algorithm::Hybrid {
            apply_hybrid_boosts(&mut items, now);
        }
        for item in items.iter_mut() {
            item.final_score = item.final_score.max(0.0);
        }
        RankedItem::sort_slate(&mut items);
        Ok(items)
    }

    /// The chronological short-circuit: score is epoch seconds, no signals, no shaping
    pub fn chronological(notes: Vec<(Note, ContentSource)>, now: DateTime<Utc>) -> Vec<RankedItem> {
        let mut items: Vec<RankedItem> = notes
            .into_iter()
            .map(|(note, source)| RankedItem {
                final_score: note.created_at().timestamp() as f64,
                signals: RankingSignals::default(),
                injected_at: now,
                injection_reason: "chronological".to_owned(),
                note,
                source,
            })
            .collect();
        RankedItem::sort_slate(&mut items);
        items
    }

    /// Fold one engagement event into the affinity tables.
    ///
    /// Affinity moves monotonically upward (a `hide` contributes nothing) and is capped at 1, as
    /// is the global author score. The note's hashtags join the viewer's engaged-hashtag set.
    pub fn record_engagement(
        &self,
        viewer: &ViewerId,
        note: &Note,
        action: EngagementAction,
        _duration_seconds: f64,
        now: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().expect("affinity lock poisoned");
        let affinity = state
            .viewer_author
            .entry(viewer.clone())
            .or_default()
            .entry(note.author_id().clone())
            .or_insert(0.0);
        *affinity = (*affinity + action.affinity_delta()).min(1.0);
        let global = state
            .global_author
            .entry(note.author_id().clone())
            .or_insert(0.0);
        *global = (*global + GLOBAL_AUTHOR_STEP).min(1.0);
        state
            .engaged_hashtags
            .entry(viewer.clone())
            .or_default()
            .extend(note.hashtags().iter().cloned());
        state.last_engagement.insert(viewer.clone(), now);
    }

    /// The viewer's learned affinity toward `author`, if any engagement has been recorded
    pub fn affinity(&self, viewer: &ViewerId, author: &AuthorId) -> Option<f64> {
        self.state
            .lock()
            .expect("affinity lock poisoned")
            .viewer_author
            .get(viewer)
            .and_then(|m| m.get(author))
            .copied()
    }

    /// The hashtags this viewer has engaged with so far
    pub fn engaged_hashtags(&self, viewer: &ViewerId) -> HashSet<String> {
        self.state
            .lock()
            .expect("affinity lock poisoned")
            .engaged_hashtags
            .get(viewer)
            .cloned()
            .unwrap_or_default()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the signals                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn author_affinity(note: &Note, profile: &ViewerProfile, view: &AffinityView) -> f64 {
    let base = if profile.follows(note.author_id()) {
        BASE_AFFINITY_FOLLOWED
    } else {
        BASE_AFFINITY_STRANGER
    };
    let learned = view.author.get(note.author_id()).copied().unwrap_or(0.0);
    let stored = profile
        .author_affinity
        .get(note.author_id())
        .copied()
        .unwrap_or(0.0);
    let historical = learned.max(stored);
    let global = view
        .global_author
        .get(note.author_id())
        .copied()
        .unwrap_or(0.0)
        * GLOBAL_SCORE_WEIGHT;
    base.max(historical).max(global).min(1.0)
}

fn content_quality(note: &Note) -> f64 {
    let mut quality = QUALITY_BASE;
    let text_length = note.text().len();
    if (50..=280).contains(&text_length) {
        quality += QUALITY_TEXT_LENGTH_BOOST;
    } else if text_length < 10 {
        quality -= QUALITY_SHORT_TEXT_PENALTY;
    }
    if note.has_media() {
        quality += QUALITY_MEDIA_BOOST;
    }
    let n_hashtags = note.hashtags().len();
    if (1..=5).contains(&n_hashtags) {
        quality += QUALITY_HASHTAG_BOOST;
    } else if n_hashtags > 10 {
        quality -= QUALITY_TAG_SPAM_PENALTY;
    }
    let n_mentions = note.mentions().len();
    if (1..=3).contains(&n_mentions) {
        quality += QUALITY_MENTION_BOOST;
    }
    if crate::entities::contains_url(note.text()) {
        quality -= QUALITY_LINK_PENALTY;
    }
    // Twice the raw engagement rate, capped; a note that converts 15% of views is already elite.
    quality += (note.counts().engagement_rate() * 2.0).min(QUALITY_ENGAGEMENT_CAP);
    quality.clamp(0.0, 1.0)
}

fn engagement_velocity(note: &Note, now: DateTime<Utc>) -> f64 {
    let age_hours = note.age_hours(now);
    if age_hours <= 0.0 {
        return 0.0;
    }
    let velocity = note.counts().total_engagements() as f64 / age_hours;
    (velocity / VELOCITY_NORMALIZER).min(1.0)
}

fn recency(note: &Note, now: DateTime<Utc>) -> f64 {
    let age_hours = note.age_hours(now).max(0.0);
    (-age_hours * std::f64::consts::LN_2 / RECENCY_HALF_LIFE_HOURS).exp()
}

fn personalization(note: &Note, view: &AffinityView) -> f64 {
    let mut score = 0.0;
    if ACTIVE_HOURS.contains(&note.created_at().hour()) {
        score += ACTIVE_HOUR_BOOST;
    }
    for tag in note.hashtags() {
        if view.hashtags.contains(tag) {
            score += ENGAGED_HASHTAG_BOOST;
        }
    }
    score.min(1.0)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         shaping passes                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn batch_hashtag_frequency(items: &[RankedItem]) -> HashMap<&str, usize> {
    let mut freq: HashMap<&str, usize> = HashMap::new();
    for item in items {
        for tag in item.note.hashtags() {
            *freq.entry(tag.as_str()).or_insert(0) += 1;
        }
    }
    freq
}

/// Pass 1: batch-level diversity. Over-represented authors are penalized, singleton hashtags get a
/// small boost, and the whole adjustment is scaled by the configured diversity weight.
fn apply_diversity_shaping(items: &mut [RankedItem], diversity_weight: f64) {
    if items.len() <= 1 {
        return;
    }
    let mut author_count: HashMap<&AuthorId, usize> = HashMap::new();
    for item in items.iter() {
        *author_count.entry(item.note.author_id()).or_insert(0) += 1;
    }
    let author_count: HashMap<AuthorId, usize> = author_count
        .into_iter()
        .map(|(k, v)| (k.clone(), v))
        .collect();
    let freq: HashMap<String, usize> = batch_hashtag_frequency(items)
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();
    for item in items.iter_mut() {
        let mut adjustment = 0.0;
        let count = author_count[item.note.author_id()];
        if count > DIVERSITY_AUTHOR_ALLOWANCE {
            adjustment -= (count - DIVERSITY_AUTHOR_ALLOWANCE) as f64 * DIVERSITY_AUTHOR_PENALTY;
        }
        for tag in item.note.hashtags() {
            if freq[tag] == 1 {
                adjustment += SINGLETON_HASHTAG_BOOST;
            }
        }
        item.final_score += adjustment * diversity_weight;
    }
}

/// Pass 2: repetition control over the emission order. Items are walked best-score-first; an
/// author's third-and-later items eat an increasing penalty, immediate same-author repeats eat
/// another, saturated hashtags drag and singletons lift.
fn apply_repetition_control(items: &mut [RankedItem]) {
    if items.len() <= 1 {
        return;
    }
    RankedItem::sort_slate(items);
    let freq: HashMap<String, usize> = batch_hashtag_frequency(items)
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();
    let mut emitted: HashMap<AuthorId, usize> = HashMap::new();
    let mut last_author: Option<AuthorId> = None;
    for item in items.iter_mut() {
        let author = item.note.author_id().clone();
        let count = emitted.entry(author.clone()).or_insert(0);
        *count += 1;
        if *count > REPETITION_SOFT_CAP {
            item.final_score -= (*count - REPETITION_SOFT_CAP) as f64 * REPETITION_PENALTY_STEP;
        }
        if last_author.as_ref() == Some(&author) {
            item.final_score -= BACK_TO_BACK_PENALTY;
        }
        last_author = Some(author);
        for tag in item.note.hashtags() {
            let f = freq[tag];
            if f == 1 {
                item.final_score += SINGLETON_HASHTAG_BOOST;
            } else if f > HASHTAG_SATURATION_THRESHOLD {
                item.final_score -= HASHTAG_SATURATION_PENALTY;
            }
        }
        item.final_score = item.final_score.max(0.0);
    }
}

/// Pass 3 (hybrid only): freshness micro-boost & a thumb on the scale for discovery sources
fn apply_hybrid_boosts(items: &mut [RankedItem], now: DateTime<Utc>) {
    for item in items.iter_mut() {
        let age_minutes = (now - item.note.created_at()).num_minutes();
        if (0..=HYBRID_FRESHNESS_WINDOW_MINUTES).contains(&age_minutes) {
            item.final_score += HYBRID_FRESHNESS_BOOST;
        }
        if item.source != ContentSource::Following {
            item.final_score += HYBRID_DISCOVERY_BOOST;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::TimeZone;

    use crate::entities::EngagementCounts;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn note_at(id: &str, author: &str, minutes_ago: i64) -> Note {
        Note::new(
            NoteId::from(id),
            AuthorId::from(author),
            "a perfectly ordinary note about nothing in particular today",
            now() - chrono::Duration::minutes(minutes_ago),
        )
    }

    fn profile_following(authors: &[&str]) -> ViewerProfile {
        let mut p = ViewerProfile::defaulted(ViewerId::from("v"), now());
        for a in authors {
            p.follow_set.insert(AuthorId::from(*a));
        }
        p
    }

    #[test]
    fn affinity_is_monotonic_and_bounded() {
        let ranker = Ranker::new();
        let v = ViewerId::from("v");
        let n = note_at("n", "a", 5);
        for _ in 0..40 {
            ranker.record_engagement(&v, &n, EngagementAction::Follow, 0.0, now());
        }
        assert_eq!(ranker.affinity(&v, &AuthorId::from("a")), Some(1.0));
        // hide never decreases affinity
        ranker.record_engagement(&v, &n, EngagementAction::Hide, 0.0, now());
        assert_eq!(ranker.affinity(&v, &AuthorId::from("a")), Some(1.0));
    }

    #[test]
    fn two_likes_compose() {
        let ranker = Ranker::new();
        let v = ViewerId::from("v");
        let n = note_at("n", "a", 5);
        ranker.record_engagement(&v, &n, EngagementAction::Like, 0.0, now());
        ranker.record_engagement(&v, &n, EngagementAction::Like, 0.0, now());
        let affinity = ranker.affinity(&v, &AuthorId::from("a")).unwrap();
        assert!((affinity - 0.10).abs() < 1e-9);
    }

    #[test]
    fn signals_stay_normalized() {
        let n = note_at("n", "a", 1)
            .with_media(true)
            .with_counts(EngagementCounts {
                views: 10,
                likes: 1000,
                reshares: 1000,
                replies: 1000,
                quotes: 1000,
            });
        let view = AffinityView {
            author: HashMap::new(),
            hashtags: HashSet::new(),
            global_author: HashMap::new(),
        };
        let p = profile_following(&["a"]);
        for signal in [
            author_affinity(&n, &p, &view),
            content_quality(&n),
            engagement_velocity(&n, now()),
            recency(&n, now()),
            personalization(&n, &view),
        ] {
            assert!((0.0..=1.0).contains(&signal), "{signal} out of range");
        }
    }

    #[test]
    fn followed_authors_score_higher() {
        let ranker = Ranker::new();
        let p = profile_following(&["friend"]);
        let items = ranker
            .score(
                vec![
                    (note_at("n1", "friend", 10), ContentSource::Following),
                    (note_at("n2", "stranger", 10), ContentSource::Recommended),
                ],
                &p.viewer_id.clone(),
                &p,
                &TimelineConfig::default(),
                now(),
            )
            .unwrap();
        assert_eq!(items[0].note.id().as_str(), "n1");
        assert!(items[0].signals.author_affinity > items[1].signals.author_affinity);
    }

    #[test]
    fn scoring_is_deterministic() {
        let ranker = Ranker::new();
        let p = profile_following(&["a"]);
        let slate = || {
            vec![
                (note_at("n1", "a", 10), ContentSource::Following),
                (note_at("n2", "b", 10), ContentSource::Recommended),
                (note_at("n3", "a", 20), ContentSource::Following),
            ]
        };
        let cfg = TimelineConfig::default();
        let a = ranker
            .score(slate(), &p.viewer_id.clone(), &p, &cfg, now())
            .unwrap();
        let b = ranker
            .score(slate(), &p.viewer_id.clone(), &p, &cfg, now())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn repetition_penalizes_author_floods() {
        // Five notes by one author, one by another, all else equal; after shaping, the lone
        // author's note must not rank last.
        let ranker = Ranker::new();
        let p = profile_following(&["flood", "solo"]);
        let mut slate: Vec<(Note, ContentSource)> = (0..5)
            .map(|i| {
                (
                    note_at(&format!("f{i}"), "flood", 10),
                    ContentSource::Following,
                )
            })
            .collect();
        slate.push((note_at("s0", "solo", 10), ContentSource::Following));
        let items = ranker
            .score(slate, &p.viewer_id.clone(), &p, &TimelineConfig::default(), now())
            .unwrap();
        let solo_rank = items
            .iter()
            .position(|i| i.note.id().as_str() == "s0")
            .unwrap();
        assert!(solo_rank < items.len() - 1);
        // and the flood's tail items were penalized below the solo note
        assert!(items[solo_rank].final_score > items.last().unwrap().final_score);
    }

    #[test]
    fn hybrid_freshness_beats_chronological_peers() {
        let ranker = Ranker::new();
        let p = profile_following(&["a"]);
        let fresh = note_at("fresh", "a", 5);
        let stale = note_at("stale", "a", 120);
        let items = ranker
            .score(
                vec![
                    (stale, ContentSource::Following),
                    (fresh, ContentSource::Following),
                ],
                &p.viewer_id.clone(),
                &p,
                &TimelineConfig::default(),
                now(),
            )
            .unwrap();
        assert_eq!(items[0].note.id().as_str(), "fresh");
    }

    #[test]
    fn chronological_short_circuit() {
        let notes = vec![
            (note_at("n1", "a", 30), ContentSource::Following),
            (note_at("n2", "b", 10), ContentSource::Following),
            (note_at("n3", "a", 50), ContentSource::Following),
        ];
        let items = Ranker::chronological(notes, now());
        let ids: Vec<&str> = items.iter().map(|i| i.note.id().as_str()).collect();
        assert_eq!(ids, vec!["n2", "n1", "n3"]);
        assert!(items.iter().all(|i| i.injection_reason == "chronological"));
    }

    #[test]
    fn scores_never_go_negative() {
        let ranker = Ranker::new();
        let p = ViewerProfile::defaulted(ViewerId::from("v"), now());
        // A flood of identical spammy notes drives heavy shaping penalties
        let slate: Vec<(Note, ContentSource)> = (0..12)
            .map(|i| {
                (
                    Note::new(
                        NoteId::from(format!("n{i:02}").as_str()),
                        AuthorId::from("spammer"),
                        "#x short",
                        now() - chrono::Duration::hours(40),
                    ),
                    ContentSource::Recommended,
                )
            })
            .collect();
        let items = ranker
            .score(slate, &ViewerId::from("v"), &p, &TimelineConfig::default(), now())
            .unwrap();
        assert!(items.iter().all(|i| i.final_score >= 0.0));
    }
}
