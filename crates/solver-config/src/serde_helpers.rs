//! Serde helpers for configuration deserialization

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use solver_types::Platform;
use std::time::Duration;

/// Deserializes `["linux/amd64", "linux/arm/v7"]` into platforms.
pub fn deserialize_platforms<'de, D>(deserializer: D) -> Result<Vec<Platform>, D::Error>
where
	D: Deserializer<'de>,
{
	let list = Vec::<String>::deserialize(deserializer)?;

	list.iter()
		.map(|s| s.parse::<Platform>().map_err(serde::de::Error::custom))
		.collect()
}

/// Serializes platforms back into their `os/arch[/variant]` strings.
pub fn serialize_platforms<S>(platforms: &[Platform], serializer: S) -> Result<S::Ok, S::Error>
where
	S: Serializer,
{
	let list: Vec<String> = platforms.iter().map(Platform::to_string).collect();

	list.serialize(serializer)
}

/// Millisecond integer fields, as durations.
pub fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
	D: Deserializer<'de>,
{
	u64::deserialize(deserializer).map(Duration::from_millis)
}

pub fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
	S: Serializer,
{
	(duration.as_millis() as u64).serialize(serializer)
}
