//! HTTP fan-in: `POST /api/broadcast`.
//!
//! The control surface for server-side publishers. Authenticated by the
//! tenant's API key (a JWT signed with the tenant secret); messages enter
//! the hub exactly as an anonymous socket publisher's would.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::channel::message::BroadcastMessage;
use crate::channel::publish;
use crate::core::extract::{ApiKey, TenantSelector};
use crate::core::metrics;
use crate::prelude::*;
use crate::rate_limit::Resource;
use crate::types::ApiResponse;

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
	pub messages: Vec<BroadcastMessage>,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResult {
	pub accepted: usize,
	pub rejected: usize,
	pub errors: Vec<serde_json::Value>,
}

pub async fn post_broadcast(
	State(app): State<App>,
	TenantSelector(tenant_id): TenantSelector,
	ApiKey(apikey): ApiKey,
	Json(body): Json<BroadcastRequest>,
) -> RmResult<Json<ApiResponse<BroadcastResult>>> {
	let tenant_id = tenant_id.ok_or_else(|| Error::TenantNotFound("unresolvable".into()))?;
	let tenant = app.tenants.lookup(&tenant_id).await?;
	let claims = app.verifier.verify(&tenant, &apikey).inspect_err(|_| {
		metrics::inc(&app.metrics.auth_failures);
	})?;
	let supervisor = app.supervisors.start_if_needed(&app, &tenant).await?;

	let mut result =
		BroadcastResult { accepted: 0, rejected: 0, errors: Vec::new() };

	for (idx, msg) in body.messages.into_iter().enumerate() {
		let outcome = async {
			msg.validate()?;
			app.limiter.check(&tenant, Resource::Events, 1)?;

			if msg.private || app.hub.is_private(&tenant_id, &msg.topic) {
				let pool = supervisor
					.pool()
					.ok_or_else(|| Error::PermissionDenied("no authorization database".into()))?;
				let allowed =
					app.authz.can_write(&pool, &tenant_id, &msg.topic, &claims).await?;
				if !allowed {
					return Err(Error::PermissionDenied(format!(
						"not allowed to publish to {}",
						msg.topic
					)));
				}
			}
			publish(&app, &tenant, &msg, None);
			Ok::<(), Error>(())
		}
		.await;

		match outcome {
			Ok(()) => result.accepted += 1,
			Err(err) => {
				result.rejected += 1;
				result.errors.push(json!({ "index": idx, "reason": err.to_string() }));
			}
		}
	}

	Ok(Json(ApiResponse::new(result)))
}

// vim: ts=4
