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

//! # notemill-test
//!
//! Shared fixtures for the notemill integration suites. Everything runs against the in-memory
//! backend; a [Fixture] is a fully-wired service (pipeline, cache, admission, fan-out worker,
//! session registry) that each test seeds to taste.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use notemill::{
    admission,
    cache,
    config::TimelineConfig,
    entities::{AuthorId, EngagementCounts, Note, NoteId, ViewerId},
    fanout::{self, Processor},
    notemill::{Builder, Notemill},
    storage::Memory,
};

/// `minutes` minutes before now; candidate windows in the suites are all relative
pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - Duration::minutes(minutes)
}

/// A perfectly ordinary note with no media, no flags & zeroed counters
pub fn note(id: &str, author: &str, text: &str, created_at: DateTime<Utc>) -> Note {
    Note::new(NoteId::from(id), AuthorId::from(author), text, created_at)
}

pub fn busy_counts() -> EngagementCounts {
    EngagementCounts {
        views: 1000,
        likes: 120,
        reshares: 30,
        replies: 15,
        quotes: 5,
    }
}

pub fn viewer(id: &str) -> ViewerId {
    ViewerId::from(id)
}

pub fn author(id: &str) -> AuthorId {
    AuthorId::from(id)
}

/// A fully-wired single-process notemill over the in-memory backend
pub struct Fixture {
    pub memory: Arc<Memory>,
    pub state: Arc<Notemill>,
    processor: Option<Processor>,
}

impl Fixture {
    /// Build a service with the given admission config; most suites use [Fixture::new]
    pub fn with_admission(admission_config: admission::Config) -> Fixture {
        let memory = Arc::new(Memory::new());
        let state = Arc::new(
            Builder {
                notes: memory.clone(),
                graph: memory.clone(),
                prefs: memory.clone(),
                remote_cache: None,
                overdrive: None,
                defaults: TimelineConfig::default(),
                cache_config: cache::Config::default(),
                admission_config,
                fanout_config: fanout::Config::default(),
                shared_token: None,
            }
            .build(),
        );
        Fixture {
            memory,
            state,
            processor: None,
        }
    }

    pub fn new() -> Fixture {
        Fixture::with_admission(admission::Config::default())
    }

    /// Start the fan-out worker; suites exercising write events call this first
    pub fn start_fanout(&mut self) {
        let processor = fanout::spawn(
            self.state.fanout.clone(),
            fanout::Context {
                graph: self.memory.clone(),
                cache: self.state.pipeline.cache().clone(),
                registry: self.state.registry.clone(),
            },
            fanout::Config::default(),
            self.state.instruments.clone(),
        );
        self.processor = Some(processor);
    }

    pub async fn stop_fanout(&mut self) {
        if let Some(processor) = self.processor.take() {
            processor
                .shutdown(std::time::Duration::from_secs(1))
                .await
                .expect("fan-out worker failed to shut down");
        }
    }

    /// Seed one followed author with one note; the smallest interesting world
    pub async fn follow_and_note(&self, viewer_id: &str, author_id: &str, note_id: &str) {
        let v = viewer(viewer_id);
        let a = author(author_id);
        self.memory.add_follow(&v, &a).await;
        self.memory
            .add_note(note(
                note_id,
                author_id,
                "a perfectly ordinary note about nothing much",
                minutes_ago(10),
            ))
            .await;
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Fixture::new()
    }
}
