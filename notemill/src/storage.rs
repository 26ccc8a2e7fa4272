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

//! # storage
//!
//! Abstractions for the stores notemill depends on but does not own. The note store, the follow
//! graph and the preference store are separate services in production; the pipeline only ever sees
//! them through the object-safe traits defined here. The [Memory] backend implements all three for
//! tests & single-process deployments, the same way one concrete session type satisfies several
//! backend traits elsewhere in this workspace.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::Backtrace;
use tokio::sync::RwLock;

use crate::{
    config::TimelinePreferences,
    entities::{AuthorId, Note, NoteId, ViewerId},
};

/// One big bucket of a failure mode: the backend call didn't complete. Callers decide whether
/// that's fatal (filtering) or survivable (a candidate source).
#[derive(Debug)]
#[allow(dead_code)] // `backtrace` is never read (?)
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
    backtrace: Backtrace,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
    pub fn msg(text: &str) -> Error {
        #[derive(Debug, snafu::Snafu)]
        #[snafu(display("{text}"))]
        struct Opaque { text: String }
        Error::new(Opaque { text: text.to_owned() })
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the three stores                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Read-only view onto the note store
#[async_trait]
pub trait NoteStore {
    /// Notes authored by any of `authors`, created strictly after `since`, newest first, at most
    /// `max_count` of them.
    async fn recent_notes_by_authors(
        &self,
        authors: &HashSet<AuthorId>,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Note>>;
    /// Recent notes regardless of author; the raw pool the recommended & trending adapters mine.
    async fn recent_notes(&self, since: DateTime<Utc>, max_count: usize) -> Result<Vec<Note>>;
    /// Lookup a single note. None means the note store has never heard of it.
    async fn note(&self, id: &NoteId) -> Result<Option<Note>>;
}

/// Read-only view onto the follow graph
#[async_trait]
pub trait FollowGraph {
    /// The set of authors `viewer` follows
    async fn follow_set(&self, viewer: &ViewerId) -> Result<HashSet<AuthorId>>;
    /// Everyone following `author`; the fan-out worker's working set
    async fn followers_of(&self, author: &AuthorId) -> Result<Vec<ViewerId>>;
    /// The union of members across the viewer's curated author lists
    async fn list_members(&self, viewer: &ViewerId) -> Result<HashSet<AuthorId>>;
}

/// Mute & NSFW state as stored, independent of any cached [ViewerProfile](crate::entities::ViewerProfile)
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct MuteState {
    pub muted_users: HashSet<AuthorId>,
    pub muted_keywords: HashSet<String>,
    pub nsfw_opt_in: bool,
}

/// The per-viewer preference store. Mutations are synchronous: once a call returns, the next
/// timeline request for that viewer observes the new state.
#[async_trait]
pub trait PreferenceStore {
    async fn preferences(&self, viewer: &ViewerId) -> Result<Option<TimelinePreferences>>;
    async fn set_preferences(&self, viewer: &ViewerId, prefs: TimelinePreferences) -> Result<()>;
    async fn mute_state(&self, viewer: &ViewerId) -> Result<MuteState>;
    async fn add_muted_user(&self, viewer: &ViewerId, muted: &AuthorId) -> Result<()>;
    async fn remove_muted_user(&self, viewer: &ViewerId, muted: &AuthorId) -> Result<()>;
    async fn add_muted_keyword(&self, viewer: &ViewerId, keyword: &str) -> Result<()>;
    async fn remove_muted_keyword(&self, viewer: &ViewerId, keyword: &str) -> Result<()>;
    async fn set_nsfw_opt_in(&self, viewer: &ViewerId, opt_in: bool) -> Result<()>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       in-memory backend                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// In-memory implementation of all three stores
///
/// This is not a toy: `notemilld` runs on it in single-process deployments, and every integration
/// test drives the real pipeline through it. One lock per map, held briefly, never across an
/// await of anything but the lock itself.
#[derive(Default)]
pub struct Memory {
    notes: RwLock<Vec<Note>>,
    follows: RwLock<HashMap<ViewerId, HashSet<AuthorId>>>,
    lists: RwLock<HashMap<ViewerId, HashSet<AuthorId>>>,
    preferences: RwLock<HashMap<ViewerId, TimelinePreferences>>,
    mutes: RwLock<HashMap<ViewerId, MuteState>>,
}

impl Memory {
    pub fn new() -> Memory {
        Memory::default()
    }
    /// Seed a note; notes are append-only snapshots, so "seeding" is all there is
    pub async fn add_note(&self, note: Note) {
        self.notes.write().await.push(note);
    }
    pub async fn add_follow(&self, viewer: &ViewerId, author: &AuthorId) {
        self.follows
            .write()
            .await
            .entry(viewer.clone())
            .or_default()
            .insert(author.clone());
    }
    pub async fn remove_follow(&self, viewer: &ViewerId, author: &AuthorId) {
        if let Some(set) = self.follows.write().await.get_mut(viewer) {
            set.remove(author);
        }
    }
    pub async fn add_list_member(&self, viewer: &ViewerId, author: &AuthorId) {
        self.lists
            .write()
            .await
            .entry(viewer.clone())
            .or_default()
            .insert(author.clone());
    }
}

#[async_trait]
impl NoteStore for Memory {
    async fn recent_notes_by_authors(
        &self,
        authors: &HashSet<AuthorId>,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Note>> {
        let notes = self.notes.read().await;
        let mut hits: Vec<Note> = notes
            .iter()
            .filter(|n| authors.contains(n.author_id()) && n.created_at() > since)
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        hits.truncate(max_count);
        Ok(hits)
    }
    async fn recent_notes(&self, since: DateTime<Utc>, max_count: usize) -> Result<Vec<Note>> {
        let notes = self.notes.read().await;
        let mut hits: Vec<Note> = notes
            .iter()
            .filter(|n| n.created_at() > since)
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        hits.truncate(max_count);
        Ok(hits)
    }
    async fn note(&self, id: &NoteId) -> Result<Option<Note>> {
        Ok(self.notes.read().await.iter().find(|n| n.id() == id).cloned())
    }
}

#[async_trait]
impl FollowGraph for Memory {
    async fn follow_set(&self, viewer: &ViewerId) -> Result<HashSet<AuthorId>> {
        Ok(self
            .follows
            .read()
            .await
            .get(viewer)
            .cloned()
            .unwrap_or_default())
    }
    async fn followers_of(&self, author: &AuthorId) -> Result<Vec<ViewerId>> {
        Ok(self
            .follows
            .read()
            .await
            .iter()
            .filter(|(_, followed)| followed.contains(author))
            .map(|(viewer, _)| viewer.clone())
            .collect())
    }
    async fn list_members(&self, viewer: &ViewerId) -> Result<HashSet<AuthorId>> {
        Ok(self
            .lists
            .read()
            .await
            .get(viewer)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PreferenceStore for Memory {
    async fn preferences(&self, viewer: &ViewerId) -> Result<Option<TimelinePreferences>> {
        Ok(self.preferences.read().await.get(viewer).cloned())
    }
    async fn set_preferences(&self, viewer: &ViewerId, prefs: TimelinePreferences) -> Result<()> {
        self.preferences.write().await.insert(viewer.clone(), prefs);
        Ok(())
    }
    async fn mute_state(&self, viewer: &ViewerId) -> Result<MuteState> {
        Ok(self.mutes.read().await.get(viewer).cloned().unwrap_or_default())
    }
    async fn add_muted_user(&self, viewer: &ViewerId, muted: &AuthorId) -> Result<()> {
        self.mutes
            .write()
            .await
            .entry(viewer.clone())
            .or_default()
            .muted_users
            .insert(muted.clone());
        Ok(())
    }
    async fn remove_muted_user(&self, viewer: &ViewerId, muted: &AuthorId) -> Result<()> {
        if let Some(state) = self.mutes.write().await.get_mut(viewer) {
            state.muted_users.remove(muted);
        }
        Ok(())
    }
    async fn add_muted_keyword(&self, viewer: &ViewerId, keyword: &str) -> Result<()> {
        self.mutes
            .write()
            .await
            .entry(viewer.clone())
            .or_default()
            .muted_keywords
            .insert(keyword.to_lowercase());
        Ok(())
    }
    async fn remove_muted_keyword(&self, viewer: &ViewerId, keyword: &str) -> Result<()> {
        if let Some(state) = self.mutes.write().await.get_mut(viewer) {
            state.muted_keywords.remove(&keyword.to_lowercase());
        }
        Ok(())
    }
    async fn set_nsfw_opt_in(&self, viewer: &ViewerId, opt_in: bool) -> Result<()> {
        self.mutes
            .write()
            .await
            .entry(viewer.clone())
            .or_default()
            .nsfw_opt_in = opt_in;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::TimeZone;

    fn t(seconds: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, seconds).unwrap()
    }

    #[tokio::test]
    async fn recent_notes_are_newest_first_and_bounded() {
        let mem = Memory::new();
        for (id, secs) in [("n1", 10), ("n2", 30), ("n3", 20)] {
            mem.add_note(Note::new(
                NoteId::from(id),
                AuthorId::from("a"),
                "x",
                t(secs),
            ))
            .await;
        }
        let hits = mem.recent_notes(t(0), 2).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|n| n.id().as_str()).collect();
        assert_eq!(ids, vec!["n2", "n3"]);
    }

    #[tokio::test]
    async fn followers_of_inverts_the_graph() {
        let mem = Memory::new();
        let a = AuthorId::from("a");
        mem.add_follow(&ViewerId::from("v1"), &a).await;
        mem.add_follow(&ViewerId::from("v2"), &a).await;
        mem.add_follow(&ViewerId::from("v3"), &AuthorId::from("b")).await;
        let mut followers = mem.followers_of(&a).await.unwrap();
        followers.sort();
        assert_eq!(followers, vec![ViewerId::from("v1"), ViewerId::from("v2")]);
    }

    #[tokio::test]
    async fn mute_state_round_trips() {
        let mem = Memory::new();
        let v = ViewerId::from("v");
        mem.add_muted_user(&v, &AuthorId::from("spammer")).await.unwrap();
        mem.add_muted_keyword(&v, "Crypto").await.unwrap();
        let state = mem.mute_state(&v).await.unwrap();
        assert!(state.muted_users.contains(&AuthorId::from("spammer")));
        // Keywords are normalized to lower case on the way in
        assert!(state.muted_keywords.contains("crypto"));
        mem.remove_muted_keyword(&v, "CRYPTO").await.unwrap();
        assert!(mem.mute_state(&v).await.unwrap().muted_keywords.is_empty());
    }
}
