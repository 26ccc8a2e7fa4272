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

//! # notemill models
//!
//! ## Introduction
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are truly
//! foundational: everything from the candidate sources to the streaming layer traffics in them.
//!
//! A word on identifiers: notes, authors & viewers come to us from upstream services that have
//! already minted ids for them (we never create a note, an author or a viewer ourselves). The ids
//! are opaque, globally-unique strings; all we ask of them is equality, hashing & a total order
//! (the latter for deterministic tie-breaking when ranking).

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a recognized engagement action"))]
    BadAction { text: String, backtrace: Backtrace },
    #[snafu(display("An identifier may not be empty"))]
    EmptyId { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// define_id!
///
/// Use this to declare a type intended to be used as an opaque identifier for some other sort of
/// entity. The upstream stores hand us their ids as strings; I just couldn't bring myself to use
/// the same type to represent identifiers for notes, authors and viewers all at the same time, so
/// this macro stamps out a newtype struct per entity sort.
///
/// The wrapped string must be non-empty; beyond that we impose no structure (the upstream id
/// schemes are none of our business). The generated type implements [Display], [FromStr], the
/// comparison traits (notes are tie-broken by id when ranking) and the serde traits.
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $type_name(String);
        impl $type_name {
            pub fn new(s: impl Into<String>) -> $type_name {
                $type_name(s.into())
            }
            pub fn checked(s: &str) -> Result<$type_name> {
                if s.is_empty() {
                    EmptyIdSnafu.fail()
                } else {
                    Ok($type_name(s.to_owned()))
                }
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl FromStr for $type_name {
            type Err = Error;

            fn from_str(s: &str) -> StdResult<Self, Self::Err> {
                $type_name::checked(s)
            }
        }
        impl AsRef<str> for $type_name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
        impl From<&str> for $type_name {
            fn from(value: &str) -> Self {
                $type_name(value.to_owned())
            }
        }
    };
}

define_id!(NoteId);
define_id!(AuthorId);
define_id!(ViewerId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         text scanning                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref HASHTAG: Regex = Regex::new(r"#(\w+)").unwrap(/* known good */);
    static ref MENTION: Regex = Regex::new(r"@(\w+)").unwrap(/* known good */);
    static ref URL: Regex = Regex::new(r"https?://\S+").unwrap(/* known good */);
}

/// Pull the hashtags (sans `#`) out of a note's text, in order of appearance
pub fn extract_hashtags(text: &str) -> Vec<String> {
    HASHTAG
        .captures_iter(text)
        .map(|cap| cap[1].to_owned())
        .collect()
}

/// Pull the mentions (sans `@`) out of a note's text, in order of appearance
pub fn extract_mentions(text: &str) -> Vec<String> {
    MENTION
        .captures_iter(text)
        .map(|cap| cap[1].to_owned())
        .collect()
}

pub fn contains_url(text: &str) -> bool {
    URL.is_match(text)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      engagement counters                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Engagement counters for a [Note], as reported by the note store
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct EngagementCounts {
    pub views: u64,
    pub likes: u64,
    pub reshares: u64,
    pub replies: u64,
    pub quotes: u64,
}

impl EngagementCounts {
    /// Views don't count as engagement; they're the denominator.
    pub fn total_engagements(&self) -> u64 {
        self.likes + self.reshares + self.replies + self.quotes
    }
    pub fn engagement_rate(&self) -> f64 {
        self.total_engagements() as f64 / std::cmp::max(1, self.views) as f64
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Note                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A short-form post, as seen by the timeline pipeline
///
/// Notes are read-only snapshots: the pipeline never mutates one, and the note store remains the
/// single source of truth. Hashtags & mentions are extracted from the text once, at construction,
/// rather than re-scanned at every ranking pass.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Note {
    id: NoteId,
    author_id: AuthorId,
    text: String,
    created_at: DateTime<Utc>,
    has_media: bool,
    hashtags: Vec<String>,
    mentions: Vec<String>,
    counts: EngagementCounts,
    nsfw: bool,
    author_suspended: bool,
}

impl Note {
    pub fn new(
        id: NoteId,
        author_id: AuthorId,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Note {
        Note {
            id,
            author_id,
            text: text.to_owned(),
            created_at,
            has_media: false,
            hashtags: extract_hashtags(text),
            mentions: extract_mentions(text),
            counts: EngagementCounts::default(),
            nsfw: false,
            author_suspended: false,
        }
    }
    pub fn with_media(mut self, has_media: bool) -> Note {
        self.has_media = has_media;
        self
    }
    pub fn with_counts(mut self, counts: EngagementCounts) -> Note {
        self.counts = counts;
        self
    }
    pub fn with_nsfw(mut self, nsfw: bool) -> Note {
        self.nsfw = nsfw;
        self
    }
    pub fn with_author_suspended(mut self, suspended: bool) -> Note {
        self.author_suspended = suspended;
        self
    }
    pub fn id(&self) -> &NoteId {
        &self.id
    }
    pub fn author_id(&self) -> &AuthorId {
        &self.author_id
    }
    pub fn text(&self) -> &str {
        &self.text
    }
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    pub fn has_media(&self) -> bool {
        self.has_media
    }
    pub fn hashtags(&self) -> &[String] {
        &self.hashtags
    }
    pub fn mentions(&self) -> &[String] {
        &self.mentions
    }
    pub fn counts(&self) -> &EngagementCounts {
        &self.counts
    }
    pub fn nsfw(&self) -> bool {
        self.nsfw
    }
    pub fn author_suspended(&self) -> bool {
        self.author_suspended
    }
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds() as f64 / 3600.0
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         ContentSource                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The logical origin a candidate note was drawn from
///
/// The ordinal matters: when the same note arrives from two sources, the lower ordinal wins
/// (FOLLOWING beats RECOMMENDED and so on down the line).
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentSource {
    Following,
    Recommended,
    Trending,
    Lists,
}

impl ContentSource {
    pub const ALL: [ContentSource; 4] = [
        ContentSource::Following,
        ContentSource::Recommended,
        ContentSource::Trending,
        ContentSource::Lists,
    ];
}

impl Display for ContentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ContentSource::Following => "following",
                ContentSource::Recommended => "recommended",
                ContentSource::Trending => "trending",
                ContentSource::Lists => "lists",
            }
        )
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       RankedItem & kin                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The five named ranking signals, each in [0, 1]
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RankingSignals {
    pub author_affinity: f64,
    pub content_quality: f64,
    pub engagement_velocity: f64,
    pub recency: f64,
    pub personalization: f64,
}

/// One [Note] wrapped with its viewer-specific ranking outcome
///
/// Scores are computed per viewer; a `RankedItem` must never be shared across viewers unmutated.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RankedItem {
    pub note: Note,
    pub source: ContentSource,
    pub final_score: f64,
    pub signals: RankingSignals,
    pub injected_at: DateTime<Utc>,
    pub injection_reason: String,
}

impl RankedItem {
    /// The sort the whole crate agrees on: `final_score` descending, then `created_at` descending,
    /// then `note_id` ascending. The last key exists purely so that two runs over identical inputs
    /// produce identical output.
    pub fn sort_slate(items: &mut [RankedItem]) {
        items.sort_by(|a, b| {
            b.final_score
                .total_cmp(&a.final_score)
                .then_with(|| b.note.created_at().cmp(&a.note.created_at()))
                .then_with(|| a.note.id().cmp(b.note.id()))
        });
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         ViewerProfile                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Per-viewer personalization state
///
/// Lifecycle: NONE → DEFAULTED (created lazily on a viewer's first request) → PRIMED (enriched by
/// engagement events) → EVICTED (cache TTL) → regenerated on the next request. There is no
/// "destroyed" terminal state; an evicted profile simply starts over at DEFAULTED.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ViewerProfile {
    pub viewer_id: ViewerId,
    pub follow_set: HashSet<AuthorId>,
    pub author_affinity: HashMap<AuthorId, f64>,
    pub hashtag_interests: HashMap<String, f64>,
    pub engaged_hashtags: HashSet<String>,
    pub muted_users: HashSet<AuthorId>,
    pub muted_keywords: HashSet<String>,
    pub nsfw_opt_in: bool,
    pub last_updated: DateTime<Utc>,
    pub avg_session_minutes: f64,
    pub daily_engagement: f64,
}

impl ViewerProfile {
    /// A fresh profile with neutral defaults; the DEFAULTED state
    pub fn defaulted(viewer_id: ViewerId, now: DateTime<Utc>) -> ViewerProfile {
        ViewerProfile {
            viewer_id,
            follow_set: HashSet::new(),
            author_affinity: HashMap::new(),
            hashtag_interests: HashMap::new(),
            engaged_hashtags: HashSet::new(),
            muted_users: HashSet::new(),
            muted_keywords: HashSet::new(),
            nsfw_opt_in: false,
            last_updated: now,
            avg_session_minutes: 15.0,
            daily_engagement: 0.5,
        }
    }
    pub fn follows(&self, author: &AuthorId) -> bool {
        self.follow_set.contains(author)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       EngagementAction                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The engagement verbs the ranker learns from
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementAction {
    Like,
    Reshare,
    Reply,
    Follow,
    Hide,
}

impl EngagementAction {
    /// How much one such action moves the viewer→author affinity (monotonically, capped at 1)
    pub fn affinity_delta(&self) -> f64 {
        match self {
            EngagementAction::Like => 0.05,
            EngagementAction::Reshare => 0.10,
            EngagementAction::Reply => 0.15,
            EngagementAction::Follow => 0.30,
            EngagementAction::Hide => 0.0,
        }
    }
}

impl FromStr for EngagementAction {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s {
            "like" => Ok(EngagementAction::Like),
            "reshare" => Ok(EngagementAction::Reshare),
            "reply" => Ok(EngagementAction::Reply),
            "follow" => Ok(EngagementAction::Follow),
            "hide" => Ok(EngagementAction::Hide),
            _ => BadActionSnafu { text: s.to_owned() }.fail(),
        }
    }
}

impl Display for EngagementAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                EngagementAction::Like => "like",
                EngagementAction::Reshare => "reshare",
                EngagementAction::Reply => "reply",
                EngagementAction::Follow => "follow",
                EngagementAction::Hide => "hide",
            }
        )
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        TimelineUpdate                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    NewItems,
    ItemUpdated,
    ItemDeleted,
    KeepAlive,
}

/// One incremental update pushed to a streaming subscriber
///
/// Push semantics are best-effort, not exactly-once; a lost update is recoverable by the next pull
/// request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TimelineUpdate {
    pub update_type: UpdateType,
    pub affected_note_id: Option<NoteId>,
    pub affected_items: Vec<RankedItem>,
}

impl TimelineUpdate {
    pub fn keep_alive() -> TimelineUpdate {
        TimelineUpdate {
            update_type: UpdateType::KeepAlive,
            affected_note_id: None,
            affected_items: Vec::new(),
        }
    }
    pub fn new_items(items: Vec<RankedItem>) -> TimelineUpdate {
        TimelineUpdate {
            update_type: UpdateType::NewItems,
            affected_note_id: None,
            affected_items: items,
        }
    }
    pub fn item_updated(note_id: NoteId) -> TimelineUpdate {
        TimelineUpdate {
            update_type: UpdateType::ItemUpdated,
            affected_note_id: Some(note_id),
            affected_items: Vec::new(),
        }
    }
    pub fn item_deleted(note_id: NoteId) -> TimelineUpdate {
        TimelineUpdate {
            update_type: UpdateType::ItemDeleted,
            affected_note_id: Some(note_id),
            affected_items: Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::TimeZone;

    #[test]
    fn scanners() {
        assert_eq!(
            extract_hashtags("shipping #rust and #tokio today"),
            vec!["rust".to_owned(), "tokio".to_owned()]
        );
        assert_eq!(
            extract_mentions("cc @alice & @bob"),
            vec!["alice".to_owned(), "bob".to_owned()]
        );
        assert!(contains_url("see https://example.com/x for details"));
        assert!(!contains_url("no links here"));
    }

    #[test]
    fn note_extraction() {
        let n = Note::new(
            NoteId::from("n-1"),
            AuthorId::from("a-1"),
            "hello #world from @me",
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        );
        assert_eq!(n.hashtags(), ["world".to_owned()]);
        assert_eq!(n.mentions(), ["me".to_owned()]);
        assert!(!n.has_media());
    }

    #[test]
    fn engagement_rate_never_divides_by_zero() {
        let c = EngagementCounts {
            views: 0,
            likes: 3,
            ..Default::default()
        };
        assert_eq!(c.engagement_rate(), 3.0);
    }

    #[test]
    fn ids_reject_empty() {
        assert!(NoteId::checked("").is_err());
        assert!("v1".parse::<ViewerId>().is_ok());
    }

    #[test]
    fn slate_sort_is_deterministic() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mk = |id: &str, score: f64| RankedItem {
            note: Note::new(NoteId::from(id), AuthorId::from("a"), "x", t),
            source: ContentSource::Following,
            final_score: score,
            signals: RankingSignals::default(),
            injected_at: t,
            injection_reason: "test".to_owned(),
        };
        let mut items = vec![mk("b", 0.5), mk("a", 0.5), mk("c", 0.9)];
        RankedItem::sort_slate(&mut items);
        let ids: Vec<&str> = items.iter().map(|i| i.note.id().as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
