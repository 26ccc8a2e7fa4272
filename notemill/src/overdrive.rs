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

//! # overdrive
//!
//! The optional external heavy ranker. It lives in another process (in production, another fleet)
//! and notemill holds it at arm's length: a two-method contract, opted into per request. The
//! pipeline hands it candidate ids in their current order; whatever scores come back replace
//! `final_score` for the matched ids, a stable re-sort follows, and ids the ranker declined to
//! score keep the score they already had.

use async_trait::async_trait;
use snafu::{Backtrace, Snafu};

use crate::entities::{NoteId, ViewerId};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Overdrive call failed: {source}"))]
    Call {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn call(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Call {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// The heavy-ranker contract
#[async_trait]
pub trait Overdrive {
    /// Re-score up to `limit` of `candidates` for `viewer`. The response may cover fewer ids than
    /// were submitted; unmatched ids are score-unchanged on our side.
    async fn rank_for_you(
        &self,
        viewer: &ViewerId,
        candidates: &[NoteId],
        limit: usize,
    ) -> Result<Vec<(NoteId, f64)>>;
    /// Cheap liveness probe; the pipeline skips the re-rank when this reports false.
    async fn is_available(&self) -> bool;
}
