//! Custom extractors for tenant-scoped requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use base64::Engine;

use crate::prelude::*;

/// Tenant selection: the `Host` subdomain when present, otherwise the
/// tenant claim baked into the `apikey` JWT. Resolution to an actual tenant
/// record (and verification of the apikey) happens at the handler.
#[derive(Clone, Debug)]
pub struct TenantSelector(pub Option<TenantId>);

/// First label of the host, when the host is a subdomain.
fn tenant_from_host(host: &str) -> Option<TenantId> {
	let host = host.split(':').next().unwrap_or(host);
	let mut labels = host.split('.');
	let first = labels.next()?;
	// Need at least sub.domain.tld for the first label to mean a tenant
	if labels.count() < 2 || first.is_empty() {
		return None;
	}
	Some(TenantId::new(first))
}

/// Read the tenant claim out of an unverified JWT payload. The token is
/// verified later against the tenant it names; a forged claim only selects
/// which secret it must survive.
fn tenant_from_token(token: &str) -> Option<TenantId> {
	let payload = token.split('.').nth(1)?;
	let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload).ok()?;
	let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
	claims
		.get("tenant")
		.or_else(|| claims.get("ref"))
		.and_then(|v| v.as_str())
		.map(TenantId::new)
}

impl FromRequestParts<App> for TenantSelector {
	type Rejection = Error;

	async fn from_request_parts(parts: &mut Parts, _state: &App) -> Result<Self, Self::Rejection> {
		if let Some(host) = parts.headers.get(axum::http::header::HOST).and_then(|h| h.to_str().ok())
		{
			if let Some(tenant) = tenant_from_host(host) {
				return Ok(TenantSelector(Some(tenant)));
			}
		}
		if let Some(apikey) = parts.headers.get("apikey").and_then(|h| h.to_str().ok()) {
			if let Some(tenant) = tenant_from_token(apikey) {
				return Ok(TenantSelector(Some(tenant)));
			}
		}
		// WebSocket clients may only be able to set query parameters
		if let Some(query) = parts.uri.query() {
			for pair in query.split('&') {
				if let Some(token) = pair.strip_prefix("apikey=").or(pair.strip_prefix("token=")) {
					if let Some(tenant) = tenant_from_token(token) {
						return Ok(TenantSelector(Some(tenant)));
					}
				}
			}
		}
		Ok(TenantSelector(None))
	}
}

/// The raw `apikey` header, for endpoints that authenticate a tenant rather
/// than a user.
#[derive(Clone, Debug)]
pub struct ApiKey(pub Box<str>);

impl FromRequestParts<App> for ApiKey {
	type Rejection = Error;

	async fn from_request_parts(parts: &mut Parts, _state: &App) -> Result<Self, Self::Rejection> {
		let apikey = parts
			.headers
			.get("apikey")
			.and_then(|h| h.to_str().ok())
			.or_else(|| {
				parts
					.headers
					.get(axum::http::header::AUTHORIZATION)
					.and_then(|h| h.to_str().ok())
					.and_then(|h| h.strip_prefix("Bearer "))
			})
			.ok_or(Error::Unauthorized)?;
		Ok(ApiKey(apikey.trim().into()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_tenant_from_host() {
		assert_eq!(
			tenant_from_host("acme.realtime.example.com"),
			Some(TenantId::new("acme"))
		);
		assert_eq!(
			tenant_from_host("acme.realtime.example.com:4000"),
			Some(TenantId::new("acme"))
		);
		assert_eq!(tenant_from_host("localhost"), None);
		assert_eq!(tenant_from_host("localhost:4000"), None);
		assert_eq!(tenant_from_host("example.com"), None);
	}

	#[test]
	fn test_tenant_from_token() {
		// {"tenant":"acme","role":"anon"} with arbitrary header/signature
		let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
			.encode(r#"{"tenant":"acme","role":"anon"}"#);
		let token = format!("eyJhbGciOiJIUzI1NiJ9.{}.sig", payload);
		assert_eq!(tenant_from_token(&token), Some(TenantId::new("acme")));
		assert_eq!(tenant_from_token("garbage"), None);
	}
}

// vim: ts=4
