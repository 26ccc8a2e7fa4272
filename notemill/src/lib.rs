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

//! # notemill
//!
//! A social-graph timeline service: candidate aggregation across weighted sources,
//! per-viewer filtering, multi-signal ranking with diversity shaping, two-tier result
//! caching with fan-out invalidation, and streamed incremental updates.
//!
//! Right now, the library crate has the same name as the binary, meaning that `rustdoc` will
//! ignore the binary crate.
pub mod admission;
pub mod api;
pub mod cache;
pub mod config;
pub mod entities;
pub mod fanout;
pub mod filter;
pub mod http;
pub mod metrics;
pub mod notemill;
pub mod overdrive;
pub mod pipeline;
pub mod ranker;
pub mod sources;
pub mod storage;
pub mod streaming;
