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

//! # the timeline API
//!
//! The typed HTTP surface over the pipeline. Every handler follows the same shape: an outer
//! function that converts to an axum [Response](axum::response::Response), wrapping a nested
//! function that returns this module's `Result` so the body can be written with `?` and Snafu's
//! context combinators.
//!
//! Admission runs first in every handler: the token bucket, then the authorization rule over the
//! caller's already-parsed claims. Per-request tuning arrives in headers (`x-ab-*-weight`,
//! `x-cap-*`, `x-discovery-share`, `x-use-overdrive`, `x-rate-rpm`); all of them are optional and
//! unknown headers are ignored.

use std::{str::FromStr, sync::Arc};

use axum::{
    extract::{Json, Path, State},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::{get, post, put},
    Router,
};
use axum_extra::extract::Query;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use http::HeaderMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tap::Pipe;
use tracing::{debug, error};

use crate::{
    admission::{self, authorize, CallerClaims, EndpointClass},
    config::{Algorithm, PerSource, RequestOverrides, TimelinePreferences},
    define_metric,
    entities::{
        self, ContentSource, EngagementAction, Note, NoteId, RankedItem, RankingSignals,
        TimelineUpdate, ViewerId,
    },
    fanout::EventKind,
    http::{ErrorCode, ErrorResponseBody},
    notemill::Notemill,
    pipeline::{self, PageMetadata, PageRequest, Pagination, DEFAULT_DEADLINE},
    storage,
    streaming::into_stream,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Admission refused the request: {source}"))]
    Admission { source: admission::Error },
    #[snafu(display("{value} is not a recognized algorithm"))]
    BadAlgorithm { value: String },
    #[snafu(display("Bad engagement action: {source}"))]
    BadAction { source: entities::Error },
    #[snafu(display("Pagination values may not be negative"))]
    NegativePagination,
    #[snafu(display("{value} is not a valid identifier: {source}"))]
    BadId {
        value: String,
        source: entities::Error,
    },
    #[snafu(display("Timeline pipeline failed: {source}"))]
    Pipeline { source: pipeline::Error },
    #[snafu(display("Preference store operation failed: {source}"))]
    Preferences { source: storage::Error },
}

impl Error {
    pub fn as_code_and_msg(&self) -> (ErrorCode, String) {
        match self {
            Error::Admission { source } => match source {
                // Don't tell a probing caller more than it needs to know.
                admission::Error::Unauthorized { .. } => {
                    (ErrorCode::Unauthorized, "Unauthorized".to_owned())
                }
                admission::Error::RateLimited { .. } => {
                    (ErrorCode::RateLimited, "Rate limit exceeded".to_owned())
                }
            },
            Error::BadAlgorithm { value } => (
                ErrorCode::InvalidArgument,
                format!("{value} is not a recognized algorithm"),
            ),
            Error::BadAction { source } => (ErrorCode::InvalidArgument, format!("{source}")),
            Error::NegativePagination => (
                ErrorCode::InvalidArgument,
                "offset & limit may not be negative".to_owned(),
            ),
            Error::BadId { value, .. } => (
                ErrorCode::InvalidArgument,
                format!("{value} is not a valid identifier"),
            ),
            Error::Pipeline { source } => match source {
                pipeline::Error::DeadlineExceeded { .. } => (
                    ErrorCode::DeadlineExceeded,
                    "request budget exhausted before any source returned".to_owned(),
                ),
                pipeline::Error::FilterFailed { .. } => (
                    ErrorCode::Internal,
                    "content filtering failed".to_owned(),
                ),
                pipeline::Error::GraphUnavailable { .. } => (
                    ErrorCode::Unavailable,
                    "follow graph unreachable".to_owned(),
                ),
                pipeline::Error::Preferences { .. } => (
                    ErrorCode::Internal,
                    "preference store failed".to_owned(),
                ),
                pipeline::Error::UnknownNote { note, .. } => (
                    ErrorCode::InvalidArgument,
                    format!("unknown note {note}"),
                ),
                pipeline::Error::NoteLookup { .. } => (
                    ErrorCode::Unavailable,
                    "note store unreachable".to_owned(),
                ),
            },
            Error::Preferences { source } => (
                ErrorCode::Unavailable,
                format!("preference store failed: {source}"),
            ),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_code_and_msg();
        if code == ErrorCode::Internal {
            error!("{self:?}");
        }
        ErrorResponseBody::new(code, msg).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        header parsing                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

// A repeated header smells like someone trying something fishy; treat it as absent.
fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(name)
        .iter()
        .at_most_one()
        .ok()
        .flatten()
        .and_then(|value| value.to_str().ok())
}

fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    matches!(header_str(headers, name), Some("1") | Some("true"))
}

fn header_parse<T: FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    header_str(headers, name).and_then(|text| text.parse::<T>().ok())
}

/// The caller's claims, as asserted by the (already-validated) transport layer
pub fn claims_from_headers(headers: &HeaderMap) -> CallerClaims {
    CallerClaims {
        caller_id: header_str(headers, "x-user-id").map(str::to_owned),
        admin: header_flag(headers, "x-admin"),
        auth_token: header_str(headers, "x-auth-token").map(str::to_owned),
        rate_rpm: header_parse(headers, "x-rate-rpm"),
    }
}

/// Per-request overrides. `for_you` selects the `x-cap-*-for-you` cap variants where present.
pub fn overrides_from_headers(headers: &HeaderMap, for_you: bool) -> RequestOverrides {
    let mut ab_weights: PerSource<Option<f64>> = PerSource::default();
    let mut caps: PerSource<Option<usize>> = PerSource::default();
    for source in ContentSource::ALL {
        ab_weights.set(source, header_parse(headers, &format!("x-ab-{source}-weight")));
        let mut cap = header_parse(headers, &format!("x-cap-{source}"));
        if for_you {
            if let Some(for_you_cap) = header_parse(headers, &format!("x-cap-{source}-for-you")) {
                cap = Some(for_you_cap);
            }
        }
        caps.set(source, cap);
    }
    RequestOverrides {
        ab_weights,
        caps,
        discovery_share: if for_you {
            header_parse::<f64>(headers, "x-discovery-share")
                .filter(|share| (0.0..=1.0).contains(share))
        } else {
            None
        },
        use_overdrive: header_flag(headers, "x-use-overdrive"),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       request & response                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TimelineQuery {
    pub algorithm: Option<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub include_ranking_signals: bool,
}

const DEFAULT_PAGE_LIMIT: usize = 20;

impl TimelineQuery {
    fn page(&self) -> Result<PageRequest> {
        if self.offset.unwrap_or(0) < 0 || self.limit.unwrap_or(0) < 0 {
            return NegativePaginationSnafu.fail();
        }
        Ok(PageRequest {
            offset: self.offset.unwrap_or(0) as usize,
            limit: self
                .limit
                .map(|limit| limit as usize)
                .unwrap_or(DEFAULT_PAGE_LIMIT),
        })
    }
    fn algorithm(&self) -> Result<Option<Algorithm>> {
        match self.algorithm.as_deref() {
            None | Some("UNSPECIFIED") | Some("") => Ok(None),
            Some("CHRONOLOGICAL") => Ok(Some(Algorithm::Chronological)),
            Some("HYBRID") => Ok(Some(Algorithm::Hybrid)),
            Some(other) => BadAlgorithmSnafu { value: other }.fail(),
        }
    }
}

/// One timeline item as it crosses the wire; `signals` is omitted unless asked for
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ItemView {
    pub note: Note,
    pub source: ContentSource,
    pub final_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signals: Option<RankingSignals>,
    pub injected_at: DateTime<Utc>,
    pub injection_reason: String,
}

impl ItemView {
    fn project(item: RankedItem, include_signals: bool) -> ItemView {
        ItemView {
            note: item.note,
            source: item.source,
            final_score: item.final_score,
            signals: include_signals.then_some(item.signals),
            injected_at: item.injected_at,
            injection_reason: item.injection_reason,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub success: bool,
    pub items: Vec<ItemView>,
    pub metadata: PageMetadata,
    pub pagination: Pagination,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Ack {
    pub success: bool,
}

const ACK: Ack = Ack { success: true };

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          admission                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

define_metric! { "api.requests", api_requests, Sort::IntegralCounter }

/// Rate-limit & authorize one request; the first thing every handler does
fn admit(state: &Notemill, headers: &HeaderMap, viewer: &ViewerId) -> Result<CallerClaims> {
    api_requests.add(1, &[]);
    let claims = claims_from_headers(headers);
    state
        .limiter
        .allow(EndpointClass::Timeline, &claims)
        .context(AdmissionSnafu)?;
    authorize(&claims, viewer, state.shared_token.as_deref()).context(AdmissionSnafu)?;
    Ok(claims)
}

fn viewer_id(raw: &str) -> Result<ViewerId> {
    ViewerId::checked(raw).context(BadIdSnafu { value: raw })
}

fn deadline() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(DEFAULT_DEADLINE).unwrap(/* known good */)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       the read endpoints                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug)]
enum Flavor {
    General,
    ForYou,
    Following,
}

async fn serve_timeline(
    state: &Notemill,
    headers: HeaderMap,
    raw_viewer: String,
    query: TimelineQuery,
    flavor: Flavor,
) -> Result<TimelineResponse> {
    let viewer = viewer_id(&raw_viewer)?;
    let _claims = admit(state, &headers, &viewer)?;
    let page = query.page()?;
    let overrides = overrides_from_headers(&headers, matches!(flavor, Flavor::ForYou));
    let mut config = state.pipeline.resolve_config(&viewer, &overrides).await;
    match flavor {
        Flavor::General => {
            if let Some(algorithm) = query.algorithm()? {
                config.algorithm = algorithm;
            }
        }
        Flavor::ForYou => {
            // For-You is hybrid by construction & honors the discovery-share knob
            config.algorithm = Algorithm::Hybrid;
            if let Some(share) = overrides.discovery_share {
                config.apply_discovery_share(share);
            }
        }
        Flavor::Following => {
            config = config.following_only();
        }
    }
    let page = state
        .pipeline
        .get_timeline(&viewer, &config, page, deadline(), overrides.use_overdrive)
        .await
        .context(PipelineSnafu)?;
    Ok(TimelineResponse {
        success: true,
        items: page
            .items
            .into_iter()
            .map(|item| ItemView::project(item, query.include_ranking_signals))
            .collect(),
        metadata: page.metadata,
        pagination: page.pagination,
    })
}

async fn get_timeline(
    State(state): State<Arc<Notemill>>,
    Path(viewer): Path<String>,
    Query(query): Query<TimelineQuery>,
    headers: HeaderMap,
) -> axum::response::Response {
    match serve_timeline(&state, headers, viewer, query, Flavor::General).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_for_you(
    State(state): State<Arc<Notemill>>,
    Path(viewer): Path<String>,
    Query(query): Query<TimelineQuery>,
    headers: HeaderMap,
) -> axum::response::Response {
    match serve_timeline(&state, headers, viewer, query, Flavor::ForYou).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_following(
    State(state): State<Arc<Notemill>>,
    Path(viewer): Path<String>,
    Query(query): Query<TimelineQuery>,
    headers: HeaderMap,
) -> axum::response::Response {
    match serve_timeline(&state, headers, viewer, query, Flavor::Following).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           refresh                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
pub struct RefreshRequest {
    pub since: DateTime<Utc>,
    pub max_items: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub success: bool,
    pub new_items: Vec<ItemView>,
    pub total_new_items: usize,
    pub has_more: bool,
}

async fn refresh_timeline(
    State(state): State<Arc<Notemill>>,
    Path(viewer): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RefreshRequest>,
) -> axum::response::Response {
    async fn refresh1(
        state: &Notemill,
        headers: HeaderMap,
        raw_viewer: String,
        req: RefreshRequest,
    ) -> Result<RefreshResponse> {
        let viewer = viewer_id(&raw_viewer)?;
        let _claims = admit(state, &headers, &viewer)?;
        if req.max_items.unwrap_or(0) < 0 {
            return NegativePaginationSnafu.fail();
        }
        let max_items = req.max_items.map(|n| n as usize).unwrap_or(DEFAULT_PAGE_LIMIT);
        let overrides = overrides_from_headers(&headers, false);
        let config = state.pipeline.resolve_config(&viewer, &overrides).await;
        let items = state
            .pipeline
            .refresh(&viewer, &config, req.since, max_items, deadline())
            .await
            .context(PipelineSnafu)?;
        // Anyone streaming this viewer hears about the fresh items right away
        if !items.is_empty() {
            state
                .registry
                .push_to(&viewer, &TimelineUpdate::new_items(items.clone()));
        }
        let has_more = items.len() >= max_items;
        Ok(RefreshResponse {
            success: true,
            total_new_items: items.len(),
            new_items: items
                .into_iter()
                .map(|item| ItemView::project(item, false))
                .collect(),
            has_more,
        })
    }
    match refresh1(&state, headers, viewer, req).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     engagement & last-read                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
pub struct EngagementRequest {
    pub note_id: String,
    pub action: String,
    #[serde(default)]
    pub duration_seconds: f64,
}

async fn record_engagement(
    State(state): State<Arc<Notemill>>,
    Path(viewer): Path<String>,
    headers: HeaderMap,
    Json(req): Json<EngagementRequest>,
) -> axum::response::Response {
    async fn record1(
        state: &Notemill,
        headers: HeaderMap,
        raw_viewer: String,
        req: EngagementRequest,
    ) -> Result<Ack> {
        let viewer = viewer_id(&raw_viewer)?;
        let _claims = admit(state, &headers, &viewer)?;
        let action = EngagementAction::from_str(&req.action).context(BadActionSnafu)?;
        let note_id = NoteId::checked(&req.note_id).context(BadIdSnafu {
            value: req.note_id.clone(),
        })?;
        state
            .pipeline
            .record_engagement(&viewer, &note_id, action, req.duration_seconds)
            .await
            .context(PipelineSnafu)?;
        Ok(ACK)
    }
    match record1(&state, headers, viewer, req).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MarkReadRequest {
    pub read_until: DateTime<Utc>,
}

async fn mark_read(
    State(state): State<Arc<Notemill>>,
    Path(viewer): Path<String>,
    headers: HeaderMap,
    Json(req): Json<MarkReadRequest>,
) -> axum::response::Response {
    async fn mark1(
        state: &Notemill,
        headers: HeaderMap,
        raw_viewer: String,
        req: MarkReadRequest,
    ) -> Result<Ack> {
        let viewer = viewer_id(&raw_viewer)?;
        let _claims = admit(state, &headers, &viewer)?;
        state.pipeline.mark_read(&viewer, req.read_until).await;
        Ok(ACK)
    }
    match mark1(&state, headers, viewer, req).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     preferences & mutes                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn get_preferences(
    State(state): State<Arc<Notemill>>,
    Path(viewer): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    async fn get1(
        state: &Notemill,
        headers: HeaderMap,
        raw_viewer: String,
    ) -> Result<TimelinePreferences> {
        let viewer = viewer_id(&raw_viewer)?;
        let _claims = admit(state, &headers, &viewer)?;
        state
            .prefs
            .preferences(&viewer)
            .await
            .context(PreferencesSnafu)?
            .unwrap_or_default()
            .pipe(Ok)
    }
    match get1(&state, headers, viewer).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn put_preferences(
    State(state): State<Arc<Notemill>>,
    Path(viewer): Path<String>,
    headers: HeaderMap,
    Json(prefs): Json<TimelinePreferences>,
) -> axum::response::Response {
    async fn put1(
        state: &Notemill,
        headers: HeaderMap,
        raw_viewer: String,
        prefs: TimelinePreferences,
    ) -> Result<Ack> {
        let viewer = viewer_id(&raw_viewer)?;
        let _claims = admit(state, &headers, &viewer)?;
        state
            .prefs
            .set_preferences(&viewer, prefs)
            .await
            .context(PreferencesSnafu)?;
        Ok(ACK)
    }
    match put1(&state, headers, viewer, prefs).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MuteUserRequest {
    pub author_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MuteKeywordRequest {
    pub keyword: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NsfwRequest {
    pub opt_in: bool,
}

/// Shared tail for all mute mutations: apply through the preference store, then drop the cached
/// profile's staleness by patching it in place. The next timeline request observes the change.
async fn after_mute_change(state: &Notemill, viewer: &ViewerId) -> Result<()> {
    let mutes = state
        .prefs
        .mute_state(viewer)
        .await
        .context(PreferencesSnafu)?;
    let cache = state.pipeline.cache();
    if let Some(mut profile) = cache.get_profile(viewer).await {
        profile.muted_users = mutes.muted_users;
        profile.muted_keywords = mutes.muted_keywords;
        profile.nsfw_opt_in = mutes.nsfw_opt_in;
        profile.last_updated = Utc::now();
        cache.put_profile(viewer, profile).await;
    }
    cache.invalidate(viewer).await;
    Ok(())
}

async fn add_muted_user(
    State(state): State<Arc<Notemill>>,
    Path(viewer): Path<String>,
    headers: HeaderMap,
    Json(req): Json<MuteUserRequest>,
) -> axum::response::Response {
    async fn add1(
        state: &Notemill,
        headers: HeaderMap,
        raw_viewer: String,
        req: MuteUserRequest,
    ) -> Result<Ack> {
        let viewer = viewer_id(&raw_viewer)?;
        let _claims = admit(state, &headers, &viewer)?;
        let muted = entities::AuthorId::checked(&req.author_id).context(BadIdSnafu {
            value: req.author_id.clone(),
        })?;
        state
            .prefs
            .add_muted_user(&viewer, &muted)
            .await
            .context(PreferencesSnafu)?;
        after_mute_change(state, &viewer).await?;
        Ok(ACK)
    }
    match add1(&state, headers, viewer, req).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn remove_muted_user(
    State(state): State<Arc<Notemill>>,
    Path((viewer, author)): Path<(String, String)>,
    headers: HeaderMap,
) -> axum::response::Response {
    async fn remove1(
        state: &Notemill,
        headers: HeaderMap,
        raw_viewer: String,
        raw_author: String,
    ) -> Result<Ack> {
        let viewer = viewer_id(&raw_viewer)?;
        let _claims = admit(state, &headers, &viewer)?;
        let author = entities::AuthorId::checked(&raw_author).context(BadIdSnafu {
            value: raw_author.clone(),
        })?;
        state
            .prefs
            .remove_muted_user(&viewer, &author)
            .await
            .context(PreferencesSnafu)?;
        after_mute_change(state, &viewer).await?;
        Ok(ACK)
    }
    match remove1(&state, headers, viewer, author).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn add_muted_keyword(
    State(state): State<Arc<Notemill>>,
    Path(viewer): Path<String>,
    headers: HeaderMap,
    Json(req): Json<MuteKeywordRequest>,
) -> axum::response::Response {
    async fn add1(
        state: &Notemill,
        headers: HeaderMap,
        raw_viewer: String,
        req: MuteKeywordRequest,
    ) -> Result<Ack> {
        let viewer = viewer_id(&raw_viewer)?;
        let _claims = admit(state, &headers, &viewer)?;
        state
            .prefs
            .add_muted_keyword(&viewer, &req.keyword)
            .await
            .context(PreferencesSnafu)?;
        after_mute_change(state, &viewer).await?;
        Ok(ACK)
    }
    match add1(&state, headers, viewer, req).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn remove_muted_keyword(
    State(state): State<Arc<Notemill>>,
    Path((viewer, keyword)): Path<(String, String)>,
    headers: HeaderMap,
) -> axum::response::Response {
    async fn remove1(
        state: &Notemill,
        headers: HeaderMap,
        raw_viewer: String,
        keyword: String,
    ) -> Result<Ack> {
        let viewer = viewer_id(&raw_viewer)?;
        let _claims = admit(state, &headers, &viewer)?;
        state
            .prefs
            .remove_muted_keyword(&viewer, &keyword)
            .await
            .context(PreferencesSnafu)?;
        after_mute_change(state, &viewer).await?;
        Ok(ACK)
    }
    match remove1(&state, headers, viewer, keyword).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn set_nsfw(
    State(state): State<Arc<Notemill>>,
    Path(viewer): Path<String>,
    headers: HeaderMap,
    Json(req): Json<NsfwRequest>,
) -> axum::response::Response {
    async fn set1(
        state: &Notemill,
        headers: HeaderMap,
        raw_viewer: String,
        req: NsfwRequest,
    ) -> Result<Ack> {
        let viewer = viewer_id(&raw_viewer)?;
        let _claims = admit(state, &headers, &viewer)?;
        state
            .prefs
            .set_nsfw_opt_in(&viewer, req.opt_in)
            .await
            .context(PreferencesSnafu)?;
        after_mute_change(state, &viewer).await?;
        Ok(ACK)
    }
    match set1(&state, headers, viewer, req).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     streaming subscription                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

define_metric! { "api.subscriptions", api_subscriptions, Sort::IntegralCounter }

async fn subscribe_updates(
    State(state): State<Arc<Notemill>>,
    Path(viewer): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    let viewer = match viewer_id(&viewer) {
        Ok(viewer) => viewer,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = admit(&state, &headers, &viewer) {
        return err.into_response();
    }
    api_subscriptions.add(1, &[]);
    debug!(viewer = %viewer, "opening update stream");
    let session = state.registry.subscribe(&viewer);
    let stream = into_stream(session).map(|update| Event::default().json_data(&update));
    // Our own keep-alive sentinels flow as data; no transport-level keep-alive needed.
    Sse::new(stream).into_response()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      internal ops surface                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A write event as a sibling service reports it
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NoteEventBody {
    pub kind: EventKind,
    pub note: Note,
}

async fn note_event(
    State(state): State<Arc<Notemill>>,
    Json(event): Json<NoteEventBody>,
) -> axum::response::Response {
    match event.kind {
        EventKind::Created => state.on_note_created(event.note),
        EventKind::Updated => state.on_note_updated(event.note),
        EventKind::Deleted => state.on_note_deleted(event.note),
    }
    Json(ACK).into_response()
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FollowEventBody {
    pub follower_id: String,
    pub followee_id: String,
    pub is_follow: bool,
}

async fn follow_event(
    State(state): State<Arc<Notemill>>,
    Json(event): Json<FollowEventBody>,
) -> axum::response::Response {
    state
        .on_follow_event(
            &ViewerId::new(event.follower_id),
            &entities::AuthorId::new(event.followee_id),
            event.is_follow,
        )
        .await;
    Json(ACK).into_response()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           health                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub uptime_seconds: i64,
    pub fanout_queue_depth: usize,
}

pub async fn health(State(state): State<Arc<Notemill>>) -> axum::response::Response {
    Json(Health {
        status: "healthy",
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        fanout_queue_depth: state.fanout.depth(),
    })
    .into_response()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           routers                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The public timeline API; the caller nests this under its version prefix
pub fn make_router(state: Arc<Notemill>) -> Router {
    Router::new()
        .route("/timeline/{viewer}", get(get_timeline))
        .route("/timeline/{viewer}/for-you", get(get_for_you))
        .route("/timeline/{viewer}/following", get(get_following))
        .route("/timeline/{viewer}/refresh", post(refresh_timeline))
        .route("/timeline/{viewer}/engagement", post(record_engagement))
        .route("/timeline/{viewer}/read", post(mark_read))
        .route(
            "/timeline/{viewer}/preferences",
            get(get_preferences).put(put_preferences),
        )
        .route("/timeline/{viewer}/mutes/users", post(add_muted_user))
        .route(
            "/timeline/{viewer}/mutes/users/{author}",
            axum::routing::delete(remove_muted_user),
        )
        .route("/timeline/{viewer}/mutes/keywords", post(add_muted_keyword))
        .route(
            "/timeline/{viewer}/mutes/keywords/{keyword}",
            axum::routing::delete(remove_muted_keyword),
        )
        .route("/timeline/{viewer}/nsfw", put(set_nsfw))
        .route("/timeline/{viewer}/updates", get(subscribe_updates))
        .with_state(state)
}

/// The locally-bound ops surface: write-event callbacks from sibling services
pub fn make_ops_router(state: Arc<Notemill>) -> Router {
    Router::new()
        .route("/events/note", post(note_event))
        .route("/events/follow", post(follow_event))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    use http::HeaderValue;

    fn headers_of(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn claims_parse() {
        let headers = headers_of(&[
            ("x-user-id", "alice"),
            ("x-admin", "1"),
            ("x-rate-rpm", "42"),
        ]);
        let claims = claims_from_headers(&headers);
        assert_eq!(claims.caller_id.as_deref(), Some("alice"));
        assert!(claims.admin);
        assert_eq!(claims.rate_rpm, Some(42));
        // Garbage in an optional header is ignored, not an error
        let claims = claims_from_headers(&headers_of(&[("x-rate-rpm", "soon")]));
        assert_eq!(claims.rate_rpm, None);
    }

    #[test]
    fn overrides_parse() {
        let headers = headers_of(&[
            ("x-ab-following-weight", "1.5"),
            ("x-cap-trending", "7"),
            ("x-cap-trending-for-you", "3"),
            ("x-discovery-share", "0.4"),
            ("x-use-overdrive", "true"),
            ("x-unknown-header", "ignored"),
        ]);
        let regular = overrides_from_headers(&headers, false);
        assert_eq!(regular.ab_weights.following, Some(1.5));
        assert_eq!(regular.caps.trending, Some(7));
        assert_eq!(regular.discovery_share, None);
        assert!(regular.use_overdrive);
        let for_you = overrides_from_headers(&headers, true);
        assert_eq!(for_you.caps.trending, Some(3));
        assert_eq!(for_you.discovery_share, Some(0.4));
    }

    #[test]
    fn discovery_share_out_of_range_is_dropped() {
        let headers = headers_of(&[("x-discovery-share", "1.7")]);
        assert_eq!(overrides_from_headers(&headers, true).discovery_share, None);
    }

    #[test]
    fn pagination_validation() {
        let query = TimelineQuery {
            offset: Some(-1),
            ..Default::default()
        };
        assert!(query.page().is_err());
        let query = TimelineQuery::default();
        let page = query.page().unwrap();
        assert_eq!(page.limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(page.offset, 0);
    }

    #[test]
    fn algorithm_validation() {
        let mut query = TimelineQuery::default();
        assert_eq!(query.algorithm().unwrap(), None);
        query.algorithm = Some("CHRONOLOGICAL".to_owned());
        assert_eq!(query.algorithm().unwrap(), Some(Algorithm::Chronological));
        query.algorithm = Some("REVERSE".to_owned());
        assert!(query.algorithm().is_err());
    }

    #[test]
    fn signals_are_omitted_unless_requested() {
        let t = Utc::now();
        let item = RankedItem {
            note: Note::new(NoteId::from("n"), entities::AuthorId::from("a"), "x", t),
            source: ContentSource::Following,
            final_score: 0.5,
            signals: RankingSignals::default(),
            injected_at: t,
            injection_reason: "following".to_owned(),
        };
        let bare = serde_json::to_value(ItemView::project(item.clone(), false)).unwrap();
        assert!(bare.get("signals").is_none());
        let full = serde_json::to_value(ItemView::project(item, true)).unwrap();
        assert!(full.get("signals").is_some());
    }
}
