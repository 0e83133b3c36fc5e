//! Per-tenant JWT verification.
//!
//! HS256 tokens verify against the tenant's stored secret; asymmetric tokens
//! against its JWKS. After the signature and time checks, every configured
//! claim validator must match the decoded claim exactly.

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::prelude::*;
use crate::tenant::model::Tenant;

const TOKENS_PER_TENANT: usize = 1024;

/// Verified claims of a client token.
#[derive(Clone, Debug)]
pub struct Claims {
	claims: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
	pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
		self.claims.get(name)
	}

	/// Database role carried by the token; anonymous when absent.
	pub fn role(&self) -> &str {
		self.claims.get("role").and_then(|v| v.as_str()).unwrap_or("anon")
	}

	pub fn sub(&self) -> Option<&str> {
		self.claims.get("sub").and_then(|v| v.as_str())
	}

	pub fn exp(&self) -> Option<i64> {
		self.claims.get("exp").and_then(|v| v.as_i64())
	}

	pub fn as_json(&self) -> serde_json::Value {
		serde_json::Value::Object(self.claims.clone())
	}

	/// Stable digest of the claim set, used as an authorization cache key.
	pub fn digest(&self) -> [u8; 32] {
		let mut hasher = Sha256::new();
		let mut keys: Vec<&String> = self.claims.keys().collect();
		keys.sort();
		for key in keys {
			hasher.update(key.as_bytes());
			hasher.update(b"=");
			hasher.update(self.claims[key].to_string().as_bytes());
			hasher.update(b";");
		}
		hasher.finalize().into()
	}
}

pub type ClaimsRef = Arc<Claims>;

type TokenHash = [u8; 32];

struct CachedToken {
	claims: ClaimsRef,
	exp: i64,
}

/// Verifies tokens and caches successful results until token expiry.
pub struct JwtVerifier {
	process_validators: HashMap<Box<str>, serde_json::Value>,
	cache: parking_lot::Mutex<HashMap<TenantId, LruCache<TokenHash, CachedToken>>>,
}

impl JwtVerifier {
	pub fn new(process_validators: HashMap<Box<str>, serde_json::Value>) -> Self {
		Self { process_validators, cache: parking_lot::Mutex::new(HashMap::new()) }
	}

	/// Verify `token` under `tenant`'s signing material and claim validators.
	pub fn verify(&self, tenant: &Tenant, token: &str) -> RmResult<ClaimsRef> {
		let hash = token_hash(token);
		let now = Timestamp::now().0;

		if let Some(claims) = self.cached(&tenant.external_id, &hash, now) {
			return Ok(claims);
		}

		let claims = self.verify_uncached(tenant, token)?;
		let exp = claims.exp().unwrap_or(now);
		let claims = Arc::new(claims);

		let mut cache = self.cache.lock();
		let per_tenant = cache.entry(tenant.external_id.clone()).or_insert_with(|| {
			LruCache::new(NonZeroUsize::new(TOKENS_PER_TENANT).unwrap_or(NonZeroUsize::MIN))
		});
		per_tenant.put(hash, CachedToken { claims: claims.clone(), exp });

		Ok(claims)
	}

	/// Drop all cached tokens for a tenant (called on tenant invalidation).
	pub fn invalidate(&self, tenant: &TenantId) {
		self.cache.lock().remove(tenant);
	}

	fn cached(&self, tenant: &TenantId, hash: &TokenHash, now: i64) -> Option<ClaimsRef> {
		let mut cache = self.cache.lock();
		let per_tenant = cache.get_mut(tenant)?;
		match per_tenant.get(hash) {
			Some(entry) if entry.exp > now => Some(entry.claims.clone()),
			Some(_) => {
				per_tenant.pop(hash);
				None
			}
			None => None,
		}
	}

	fn verify_uncached(&self, tenant: &Tenant, token: &str) -> RmResult<Claims> {
		let header = decode_header(token).map_err(|err| {
			debug!("jwt header rejected: {}", err);
			Error::Unauthorized
		})?;

		let (key, algorithm) = match header.alg {
			Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
				(DecodingKey::from_secret(tenant.jwt_secret.as_bytes()), header.alg)
			}
			alg => (self.jwks_key(tenant, header.kid.as_deref())?, alg),
		};

		let mut validation = Validation::new(algorithm);
		validation.validate_nbf = true;
		validation.set_required_spec_claims(&["exp"]);
		// Exact audience/issuer matching is handled by the claim validators
		validation.validate_aud = false;

		let data = decode::<serde_json::Map<String, serde_json::Value>>(token, &key, &validation)?;
		let claims = Claims { claims: data.claims };

		self.check_validators(&self.process_validators, &claims)?;
		self.check_validators(&tenant.jwt_claim_validators, &claims)?;

		Ok(claims)
	}

	fn jwks_key(&self, tenant: &Tenant, kid: Option<&str>) -> RmResult<DecodingKey> {
		let Some(raw) = tenant.jwt_jwks.as_deref() else {
			debug!("asymmetric token but tenant {} has no jwks", tenant.external_id);
			return Err(Error::Unauthorized);
		};
		let set: JwkSet = serde_json::from_str(raw).map_err(|err| {
			warn!("tenant {} carries invalid jwks: {}", tenant.external_id, err);
			Error::Unauthorized
		})?;
		let jwk = match kid {
			Some(kid) => set.find(kid),
			None => set.keys.first(),
		}
		.ok_or(Error::Unauthorized)?;

		DecodingKey::from_jwk(jwk).map_err(|err| {
			warn!("tenant {} jwk unusable: {}", tenant.external_id, err);
			Error::Unauthorized
		})
	}

	fn check_validators(
		&self,
		validators: &HashMap<Box<str>, serde_json::Value>,
		claims: &Claims,
	) -> RmResult<()> {
		for (name, expected) in validators {
			if claims.get(name) != Some(expected) {
				debug!("claim mismatch on {}", name);
				return Err(Error::PermissionDenied(format!("claim mismatch: {}", name)));
			}
		}
		Ok(())
	}
}

fn token_hash(token: &str) -> TokenHash {
	let mut hasher = Sha256::new();
	hasher.update(token.as_bytes());
	hasher.finalize().into()
}

#[cfg(test)]
mod tests {
	use super::*;
	use jsonwebtoken::{encode, EncodingKey, Header};
	use serde_json::json;
	use std::collections::HashMap;

	fn tenant(secret: &str) -> Tenant {
		Tenant {
			external_id: TenantId::new("acme"),
			jwt_secret: secret.into(),
			jwt_jwks: None,
			jwt_claim_validators: HashMap::new(),
			max_concurrent_clients: 200,
			max_events_per_sec: 100,
			max_joins_per_sec: 100,
			max_bytes_per_sec: 100 * 1024,
			max_channels_per_client: 100,
			suspended: false,
			persist_broadcasts: false,
			extensions: Vec::new(),
		}
	}

	fn sign(secret: &str, claims: serde_json::Value) -> String {
		encode(
			&Header::new(jsonwebtoken::Algorithm::HS256),
			&claims,
			&EncodingKey::from_secret(secret.as_bytes()),
		)
		.unwrap()
	}

	#[test]
	fn test_verify_good_token() {
		let verifier = JwtVerifier::new(HashMap::new());
		let tenant = tenant("s3cr3t");
		let token = sign(
			"s3cr3t",
			json!({ "role": "authenticated", "exp": Timestamp::from_now(60).0 }),
		);
		let claims = verifier.verify(&tenant, &token).unwrap();
		assert_eq!(claims.role(), "authenticated");
	}

	#[test]
	fn test_reject_bad_signature() {
		let verifier = JwtVerifier::new(HashMap::new());
		let tenant = tenant("s3cr3t");
		let token = sign("wrong", json!({ "exp": Timestamp::from_now(60).0 }));
		assert!(matches!(verifier.verify(&tenant, &token), Err(Error::Unauthorized)));
	}

	#[test]
	fn test_reject_expired() {
		let verifier = JwtVerifier::new(HashMap::new());
		let tenant = tenant("s3cr3t");
		let token = sign("s3cr3t", json!({ "exp": Timestamp::from_now(-3600).0 }));
		assert!(matches!(verifier.verify(&tenant, &token), Err(Error::TokenExpired)));
	}

	#[test]
	fn test_reject_garbage() {
		let verifier = JwtVerifier::new(HashMap::new());
		let tenant = tenant("s3cr3t");
		assert!(matches!(verifier.verify(&tenant, "not-a-token"), Err(Error::Unauthorized)));
	}

	#[test]
	fn test_claim_validators() {
		let verifier = JwtVerifier::new(HashMap::new());
		let mut tenant = tenant("s3cr3t");
		tenant.jwt_claim_validators.insert("iss".into(), json!("relaymesh"));

		let good = sign(
			"s3cr3t",
			json!({ "iss": "relaymesh", "exp": Timestamp::from_now(60).0 }),
		);
		assert!(verifier.verify(&tenant, &good).is_ok());

		let bad = sign(
			"s3cr3t",
			json!({ "iss": "somebody-else", "exp": Timestamp::from_now(60).0 }),
		);
		assert!(matches!(verifier.verify(&tenant, &bad), Err(Error::PermissionDenied(_))));
	}

	#[test]
	fn test_cache_evicted_on_invalidate() {
		let verifier = JwtVerifier::new(HashMap::new());
		let tenant = tenant("s3cr3t");
		let token = sign("s3cr3t", json!({ "exp": Timestamp::from_now(60).0 }));
		verifier.verify(&tenant, &token).unwrap();
		assert!(verifier.cache.lock().contains_key(&tenant.external_id));
		verifier.invalidate(&tenant.external_id);
		assert!(!verifier.cache.lock().contains_key(&tenant.external_id));
	}

	#[test]
	fn test_claims_digest_is_order_independent() {
		let a = Claims {
			claims: serde_json::from_value(json!({ "a": 1, "b": 2 })).unwrap(),
		};
		let b = Claims {
			claims: serde_json::from_value(json!({ "b": 2, "a": 1 })).unwrap(),
		};
		assert_eq!(a.digest(), b.digest());
	}
}

// vim: ts=4
