use actix_web::dev::Payload;
use actix_web::{web, FromRequest, HttpRequest, Scope};
use std::future::{ready, Ready};
use vulnscan_core::UserId;

use crate::error::ApiError;

pub mod scans;

pub const USER_HEADER: &str = "X-User-Id";

pub fn create_api_router() -> Scope {
    web::scope("/api").service(scan_routes())
}

fn scan_routes() -> Scope {
    web::scope("/scans")
        .configure(scans::configure_scan_routes)
}

/// Caller identity, resolved upstream and forwarded in the `X-User-Id` header.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub UserId);

impl FromRequest for Caller {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let caller = req
            .headers()
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<UserId>().ok())
            .map(Caller)
            .ok_or_else(|| ApiError::Forbidden(format!("missing or invalid {} header", USER_HEADER)));
        ready(caller)
    }
}
