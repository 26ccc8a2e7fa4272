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

//! # request admission
//!
//! Token-bucket rate limiting & authorization. Token validation itself happened at the transport
//! edge; by the time a request reaches us its claims are already parsed and we only decide two
//! things: is this caller allowed to act as this viewer, and has it been asking too often.
//!
//! Buckets are keyed by (endpoint class, caller id). A caller may volunteer a *lower* rate for
//! itself via `x-rate-rpm`; an attempt to raise the limit that way is ignored.

use std::{collections::HashMap, fmt::Display, sync::Mutex};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use snafu::{Backtrace, Snafu};
use tracing::debug;

use crate::{define_metric, entities::ViewerId};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Caller {caller} may not act for viewer {viewer}"))]
    Unauthorized {
        caller: String,
        viewer: ViewerId,
        backtrace: Backtrace,
    },
    #[snafu(display("Rate limit exceeded for {caller} on {class}"))]
    RateLimited {
        caller: String,
        class: EndpointClass,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         caller claims                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What the (already-validated) transport layer asserts about the caller
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallerClaims {
    /// The caller's asserted identity (`x-user-id`); absent means an internal caller the
    /// perimeter already vouched for
    pub caller_id: Option<String>,
    /// `x-admin` elevation
    pub admin: bool,
    /// `x-auth-token`, compared to the deployment's shared token when one is configured
    pub auth_token: Option<String>,
    /// `x-rate-rpm`; only honored downward
    pub rate_rpm: Option<u32>,
}

impl CallerClaims {
    /// The bucket key component for this caller; anonymous internal callers share one bucket
    pub fn bucket_id(&self) -> &str {
        self.caller_id.as_deref().unwrap_or("-")
    }
}

/// The authorization rule: the asserted identity must equal the requested viewer, or the caller
/// must be admin. A caller with no asserted identity is an internal one the perimeter already
/// validated, and passes. If the deployment configured a shared token, it must match regardless.
pub fn authorize(
    claims: &CallerClaims,
    viewer: &ViewerId,
    shared_token: Option<&str>,
) -> Result<()> {
    if let Some(required) = shared_token {
        if claims.auth_token.as_deref() != Some(required) {
            return UnauthorizedSnafu {
                caller: claims.bucket_id().to_owned(),
                viewer: viewer.clone(),
            }
            .fail();
        }
    }
    match claims.caller_id.as_deref() {
        Some(caller) if caller != viewer.as_str() && !claims.admin => UnauthorizedSnafu {
            caller: caller.to_owned(),
            viewer: viewer.clone(),
        }
        .fail(),
        _ => Ok(()),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        endpoint classes                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointClass {
    Login,
    Register,
    Timeline,
    NoteCreate,
}

impl Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                EndpointClass::Login => "login",
                EndpointClass::Register => "register",
                EndpointClass::Timeline => "timeline",
                EndpointClass::NoteCreate => "note-create",
            }
        )
    }
}

/// Per-class limits: steady-state refill rate & burst capacity
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct Limits {
    pub rpm: u32,
    pub burst: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub login: Limits,
    pub register: Limits,
    pub timeline: Limits,
    #[serde(rename = "note-create")]
    pub note_create: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            login: Limits { rpm: 30, burst: 10 },
            register: Limits { rpm: 10, burst: 5 },
            timeline: Limits {
                rpm: 600,
                burst: 100,
            },
            note_create: Limits { rpm: 60, burst: 20 },
        }
    }
}

impl Config {
    fn limits(&self, class: EndpointClass) -> Limits {
        match class {
            EndpointClass::Login => self.login,
            EndpointClass::Register => self.register,
            EndpointClass::Timeline => self.timeline,
            EndpointClass::NoteCreate => self.note_create,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         token buckets                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

define_metric! { "admission.rejections", admission_rejections, Sort::IntegralCounter }

/// The shared rate-limiter: one token bucket per (endpoint class, caller)
pub struct RateLimiter {
    config: Config,
    buckets: Mutex<HashMap<(EndpointClass, String), Bucket>>,
}

impl RateLimiter {
    pub fn new(config: Config) -> RateLimiter {
        RateLimiter {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token from the caller's bucket for `class`, refilled at `rpm/60` tokens per
    /// second up to the burst capacity. New buckets start full. Returns an error when no whole
    /// token is available.
    pub fn allow(&self, class: EndpointClass, claims: &CallerClaims) -> Result<()> {
        self.allow_at(class, claims, Utc::now())
    }

    // Time-injected variant; `allow` is the only production caller.
    pub fn allow_at(
        &self,
        class: EndpointClass,
        claims: &CallerClaims,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let defaults = self.config.limits(class);
        // Downward-only override; a request asking for *more* than the deployment allows is
        // quietly held to the deployment's limit.
        let rpm = match claims.rate_rpm {
            Some(requested) => std::cmp::min(requested, defaults.rpm),
            None => defaults.rpm,
        };
        let burst = f64::from(defaults.burst);
        let caller = claims.bucket_id().to_owned();
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        let bucket = buckets
            .entry((class, caller.clone()))
            .or_insert_with(|| Bucket {
                tokens: burst,
                last_refill: now,
            });
        let elapsed = (now - bucket.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed * f64::from(rpm) / 60.0).min(burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            debug!(caller = %caller, class = %class, "rate limited");
            admission_rejections.add(1, &[]);
            RateLimitedSnafu { caller, class }.fail()
        }
    }
}
