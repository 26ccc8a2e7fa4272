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

//! # content filter
//!
//! Per-viewer preference & global safety filtering of candidate sets. The filter is pure over its
//! inputs (the notes and the viewer's profile); mute mutations happen synchronously against the
//! preference store and show up here on the next request via the rebuilt profile.
//!
//! Unlike a candidate source, the filter is *not* allowed to fail open: if filtering errors, the
//! pipeline rejects the whole request rather than risk showing content a viewer asked never to
//! see.

use lazy_static::lazy_static;
use regex::Regex;
use snafu::{Backtrace, Snafu};
use tracing::debug;

use crate::entities::{Note, ViewerId, ViewerProfile};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Content filtering failed for {viewer}: {reason}"))]
    FailClosed {
        viewer: ViewerId,
        reason: String,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Why a note was withheld from a viewer; mostly for logs & counters
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rejection {
    MutedAuthor,
    MutedKeyword,
    Nsfw,
    AuthorSuspended,
    Spam,
}

const MAX_HASHTAGS: usize = 10;

lazy_static! {
    // Four or more punctuation marks in a row is our "repeated punctuation" spam signature.
    static ref REPEATED_PUNCTUATION: Regex = Regex::new(r"[!?.,;:]{4,}").unwrap(/* known good */);
    static ref WORD: Regex = Regex::new(r"\w+").unwrap(/* known good */);
}

/// True if any whole word of `text` matches `keyword` (case-insensitively). A muted keyword
/// "rust" removes "Rust is great" but not "trust me".
fn matches_keyword(text: &str, keyword: &str) -> bool {
    WORD.find_iter(text)
        .any(|word| word.as_str().eq_ignore_ascii_case(keyword))
}

fn is_spam(note: &Note) -> bool {
    note.hashtags().len() > MAX_HASHTAGS || REPEATED_PUNCTUATION.is_match(note.text())
}

/// Per-viewer preference + global safety filter
#[derive(Debug, Default)]
pub struct ContentFilter;

impl ContentFilter {
    pub fn new() -> ContentFilter {
        ContentFilter
    }
    /// Why `note` must not be shown to the holder of `profile`, or None if it may
    pub fn rejection(&self, note: &Note, profile: &ViewerProfile) -> Option<Rejection> {
        if profile.muted_users.contains(note.author_id()) {
            return Some(Rejection::MutedAuthor);
        }
        if profile
            .muted_keywords
            .iter()
            .any(|kw| matches_keyword(note.text(), kw))
        {
            return Some(Rejection::MutedKeyword);
        }
        if note.nsfw() && !profile.nsfw_opt_in {
            return Some(Rejection::Nsfw);
        }
        if note.author_suspended() {
            return Some(Rejection::AuthorSuspended);
        }
        if is_spam(note) {
            return Some(Rejection::Spam);
        }
        None
    }
    /// Filter `notes` down to what `viewer` may see.
    ///
    /// The signature is fallible because the contract is: on *any* filtering failure, fail closed.
    /// This implementation has no failure modes of its own, but the pipeline treats an `Err` from
    /// here as `INTERNAL` and refuses to serve the request.
    pub fn filter(
        &self,
        notes: Vec<Note>,
        viewer: &ViewerId,
        profile: &ViewerProfile,
    ) -> Result<Vec<Note>> {
        let before = notes.len();
        let kept: Vec<Note> = notes
            .into_iter()
            .filter(|note| match self.rejection(note, profile) {
                Some(reason) => {
                    debug!(viewer = %viewer, note = %note.id(), ?reason, "filtered");
                    false
                }
                None => true,
            })
            .collect();
        debug!(viewer = %viewer, before, after = kept.len(), "content filter pass");
        Ok(kept)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Utc;

    use crate::entities::{AuthorId, NoteId};

    fn note(id: &str, author: &str, text: &str) -> Note {
        Note::new(NoteId::from(id), AuthorId::from(author), text, Utc::now())
    }

    fn profile() -> ViewerProfile {
        ViewerProfile::defaulted(ViewerId::from("v"), Utc::now())
    }

    #[test]
    fn muted_author_is_removed() {
        let mut p = profile();
        p.muted_users.insert(AuthorId::from("loud"));
        let filter = ContentFilter::new();
        let kept = filter
            .filter(
                vec![note("n1", "loud", "hello"), note("n2", "quiet", "hello")],
                &p.viewer_id.clone(),
                &p,
            )
            .unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id().as_str(), "n2");
        // The invariant: every removed author was in the muted set
        assert!(p.muted_users.contains(&AuthorId::from("loud")));
    }

    #[test]
    fn keyword_match_is_whole_word_and_case_insensitive() {
        let mut p = profile();
        p.muted_keywords.insert("rust".to_owned());
        let f = ContentFilter::new();
        assert_eq!(
            f.rejection(&note("n1", "a", "Rust is great"), &p),
            Some(Rejection::MutedKeyword)
        );
        assert_eq!(f.rejection(&note("n2", "a", "trust me"), &p), None);
    }

    #[test]
    fn nsfw_requires_opt_in() {
        let f = ContentFilter::new();
        let n = note("n1", "a", "racy").with_nsfw(true);
        let mut p = profile();
        assert_eq!(f.rejection(&n, &p), Some(Rejection::Nsfw));
        p.nsfw_opt_in = true;
        assert_eq!(f.rejection(&n, &p), None);
    }

    #[test]
    fn suspended_authors_are_always_removed() {
        let f = ContentFilter::new();
        let n = note("n1", "a", "fine text").with_author_suspended(true);
        assert_eq!(f.rejection(&n, &profile()), Some(Rejection::AuthorSuspended));
    }

    #[test]
    fn spam_signatures() {
        let f = ContentFilter::new();
        assert_eq!(
            f.rejection(&note("n1", "a", "BUY NOW!!!!!"), &profile()),
            Some(Rejection::Spam)
        );
        let tags = (0..11).map(|i| format!("#t{i}")).collect::<Vec<_>>().join(" ");
        assert_eq!(
            f.rejection(&note("n2", "a", &tags), &profile()),
            Some(Rejection::Spam)
        );
        assert_eq!(f.rejection(&note("n3", "a", "What?! Really."), &profile()), None);
    }
}
