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

//! Admission suites: the rate limiter & the authorization rule as wired into a full service.

use notemill::admission::{self, authorize, CallerClaims, EndpointClass, Limits};
use notemill_test::{viewer, Fixture};

fn claims(caller: &str) -> CallerClaims {
    CallerClaims {
        caller_id: Some(caller.to_owned()),
        ..Default::default()
    }
}

/// One request per minute, burst of one: the first request lands, the second bounces.
#[tokio::test]
async fn second_request_is_rate_limited() {
    let fx = Fixture::with_admission(admission::Config {
        timeline: Limits { rpm: 1, burst: 1 },
        ..Default::default()
    });
    let c = claims("v");
    assert!(fx.state.limiter.allow(EndpointClass::Timeline, &c).is_ok());
    assert!(fx.state.limiter.allow(EndpointClass::Timeline, &c).is_err());
}

#[tokio::test]
async fn identity_must_match_unless_admin() {
    let v = viewer("alice");
    assert!(authorize(&claims("alice"), &v, None).is_ok());
    assert!(authorize(&claims("mallory"), &v, None).is_err());
    let admin = CallerClaims {
        caller_id: Some("ops".to_owned()),
        admin: true,
        ..Default::default()
    };
    assert!(authorize(&admin, &v, None).is_ok());
}

/// Limits are per caller; one noisy neighbor doesn't starve another.
#[tokio::test]
async fn callers_do_not_share_buckets() {
    let fx = Fixture::with_admission(admission::Config {
        timeline: Limits { rpm: 1, burst: 1 },
        ..Default::default()
    });
    assert!(fx
        .state
        .limiter
        .allow(EndpointClass::Timeline, &claims("alice"))
        .is_ok());
    assert!(fx
        .state
        .limiter
        .allow(EndpointClass::Timeline, &claims("alice"))
        .is_err());
    assert!(fx
        .state
        .limiter
        .allow(EndpointClass::Timeline, &claims("bob"))
        .is_ok());
}
