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

//! # Assorted http utilities
//!
//! The response envelope every notemill endpoint speaks: successes carry the full result
//! structure, failures carry a stable `error_code` plus a human-readable message. This is a
//! low-level module that doesn't depend on much of anything else.

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          error codes                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The stable wire-visible error vocabulary
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    RateLimited,
    InvalidArgument,
    DeadlineExceeded,
    Internal,
    Unavailable,
}

impl ErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::FORBIDDEN,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ErrorCode::Unauthorized => "UNAUTHORIZED",
                ErrorCode::RateLimited => "RATE_LIMITED",
                ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
                ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
                ErrorCode::Internal => "INTERNAL",
                ErrorCode::Unavailable => "UNAVAILABLE",
            }
        )
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        Error Responses                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The failure shape of the envelope; intended for use in the `IntoResponse` implementations of
/// whatever error type an axum handler is using
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub success: bool,
    pub error_code: ErrorCode,
    pub error_message: String,
}

impl ErrorResponseBody {
    pub fn new(error_code: ErrorCode, error_message: impl Into<String>) -> ErrorResponseBody {
        ErrorResponseBody {
            success: false,
            error_code,
            error_message: error_message.into(),
        }
    }
}

impl axum::response::IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        (self.error_code.status(), Json(self)).into_response()
    }
}
