// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

/// Issuing and revoking OAuth2 access tokens.
pub mod oauth;
/// The generic TR code request all REST functionality builds on.
pub mod tr;

/// The API base URL used for live trading.
pub(crate) const API_BASE_URL: &str = "https://api.kiwoom.com";
/// The API base URL used for paper trading.
pub(crate) const MOCK_API_BASE_URL: &str = "https://mockapi.kiwoom.com";
/// The HTTP header carrying the bearer token.
pub(crate) const HDR_AUTHORIZATION: &str = "authorization";
/// The HTTP header carrying the TR code of a request.
pub(crate) const HDR_API_ID: &str = "api-id";
/// The HTTP header indicating a continued (paged) request or response.
pub(crate) const HDR_CONT_YN: &str = "cont-yn";
/// The HTTP header carrying the continuation cursor.
pub(crate) const HDR_NEXT_KEY: &str = "next-key";
/// The content type of all request bodies.
pub(crate) const CONTENT_TYPE_JSON: &str = "application/json;charset=UTF-8";
