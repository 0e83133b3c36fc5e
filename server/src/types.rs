//! Common types used throughout the Relaymesh server.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

// TenantId //
//**********//
/// External tenant identifier. Cheap to clone, used as a key everywhere.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct TenantId(pub Arc<str>);

impl TenantId {
	pub fn new(id: impl AsRef<str>) -> Self {
		TenantId(Arc::from(id.as_ref()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for TenantId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<&str> for TenantId {
	fn from(s: &str) -> Self {
		TenantId::new(s)
	}
}

impl Serialize for TenantId {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.0)
	}
}

impl<'de> Deserialize<'de> for TenantId {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		Ok(TenantId(Arc::from(String::deserialize(deserializer)?)))
	}
}

// SubRef //
//********//
/// Unique reference for one channel subscription (one join).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SubRef(pub Uuid);

impl SubRef {
	pub fn generate() -> Self {
		SubRef(Uuid::new_v4())
	}
}

impl std::fmt::Display for SubRef {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

// Timestamp //
//***********//
#[derive(Clone, Copy, Debug, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
	pub fn now() -> Timestamp {
		let res = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
		Timestamp(res.as_secs() as i64)
	}

	pub fn from_now(delta: i64) -> Timestamp {
		let res = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
		Timestamp(res.as_secs() as i64 + delta)
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::cmp::PartialEq for Timestamp {
	fn eq(&self, other: &Self) -> bool {
		self.0 == other.0
	}
}

impl std::cmp::PartialOrd for Timestamp {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl std::cmp::Eq for Timestamp {}

impl std::cmp::Ord for Timestamp {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.0.cmp(&other.0)
	}
}

impl Serialize for Timestamp {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_i64(self.0)
	}
}

impl<'de> Deserialize<'de> for Timestamp {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		Ok(Timestamp(i64::deserialize(deserializer)?))
	}
}

// Lsn //
//*****//
/// Postgres log sequence number. Displayed in the usual `XXX/YYY` hex form.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Lsn(pub u64);

impl Lsn {
	pub fn parse(s: &str) -> Option<Lsn> {
		let (hi, lo) = s.split_once('/')?;
		let hi = u64::from_str_radix(hi, 16).ok()?;
		let lo = u64::from_str_radix(lo, 16).ok()?;
		Some(Lsn((hi << 32) | lo))
	}
}

impl std::fmt::Display for Lsn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
	}
}

impl Serialize for Lsn {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for Lsn {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Lsn::parse(&s).ok_or_else(|| serde::de::Error::custom("invalid LSN"))
	}
}

// API Response Envelope & Error Types //
//*************************************//

/// Success response envelope for single objects
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
	pub data: T,
	pub time: Timestamp,
}

impl<T> ApiResponse<T> {
	pub fn new(data: T) -> Self {
		Self { data, time: Timestamp::now() }
	}
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
	pub error: ErrorDetails,
}

/// Error details with structured code and message
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
	pub code: String,
	pub message: String,
}

impl ErrorResponse {
	pub fn new(code: String, message: String) -> Self {
		Self { error: ErrorDetails { code, message } }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_lsn_roundtrip() {
		let lsn = Lsn::parse("16/B374D848").unwrap();
		assert_eq!(lsn.0, (0x16u64 << 32) | 0xB374D848);
		assert_eq!(lsn.to_string(), "16/B374D848");
	}

	#[test]
	fn test_lsn_ordering() {
		let a = Lsn::parse("0/1000").unwrap();
		let b = Lsn::parse("0/2000").unwrap();
		let c = Lsn::parse("1/0").unwrap();
		assert!(a < b);
		assert!(b < c);
	}

	#[test]
	fn test_lsn_parse_invalid() {
		assert!(Lsn::parse("nope").is_none());
		assert!(Lsn::parse("1-2").is_none());
		assert!(Lsn::parse("zz/10").is_none());
	}
}

// vim: ts=4
