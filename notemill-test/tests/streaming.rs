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

//! Streaming suites: the session registry & update stream wired into the whole service.

use std::time::Duration;

use futures::StreamExt;

use notemill::{
    config::TimelineConfig,
    entities::{TimelineUpdate, UpdateType},
    streaming::into_stream,
};
use notemill_test::{author, minutes_ago, note, viewer, Fixture};

/// A refresh with fresh items notifies the viewer's open sessions.
#[tokio::test]
async fn refresh_notifies_subscribers() {
    let fx = Fixture::new();
    let v = viewer("v");
    fx.memory.add_follow(&v, &author("a")).await;
    fx.memory
        .add_note(note("n1", "a", "something newly minted", minutes_ago(2)))
        .await;

    let session = fx.state.registry.subscribe(&v);
    let mut stream = Box::pin(into_stream(session));

    let config = TimelineConfig::default();
    let deadline = chrono::Utc::now() + chrono::Duration::seconds(30);
    let items = fx
        .state
        .pipeline
        .refresh(&v, &config, minutes_ago(60), 20, deadline)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    // The refresh endpoint is what pushes; emulate its tail here
    fx.state
        .registry
        .push_to(&v, &TimelineUpdate::new_items(items));

    let update = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("no update in time")
        .expect("stream ended early");
    assert_eq!(update.update_type, UpdateType::NewItems);
    assert_eq!(update.affected_items.len(), 1);
}

/// An idle stream heartbeats rather than going silent.
#[tokio::test]
async fn idle_streams_emit_keep_alives() {
    let fx = Fixture::new();
    let session = fx.state.registry.subscribe(&viewer("v"));
    let mut stream = Box::pin(into_stream(session));
    let update = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("no keep-alive in time")
        .expect("stream ended early");
    assert_eq!(update.update_type, UpdateType::KeepAlive);
}

/// Dropping every strong handle ends delivery; the registry notices on its next observation.
#[tokio::test]
async fn disconnects_prune_the_registry() {
    let fx = Fixture::new();
    let v = viewer("v");
    let session = fx.state.registry.subscribe(&v);
    assert_eq!(fx.state.registry.session_count(&v), 1);
    drop(session);
    assert_eq!(
        fx.state
            .registry
            .push_to(&v, &TimelineUpdate::keep_alive()),
        0
    );
    assert_eq!(fx.state.registry.session_count(&v), 0);
}
