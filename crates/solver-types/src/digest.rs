//! Content digests and opaque identities.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// A `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
	pub const ALGORITHM: &'static str = "sha256";

	pub fn from_bytes(data: impl AsRef<[u8]>) -> Self {
		let hash = Sha256::digest(data.as_ref());
		Digest(format!("{}:{}", Self::ALGORITHM, hex::encode(hash)))
	}

	/// Parses an already formatted digest string.
	pub fn parse(s: &str) -> Option<Self> {
		let hex_part = s.strip_prefix("sha256:")?;
		if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
			return None;
		}
		Some(Digest(s.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// The hex part without the algorithm prefix.
	pub fn encoded(&self) -> &str {
		self.0.split_once(':').map(|(_, hex)| hex).unwrap_or(&self.0)
	}
}

impl fmt::Display for Digest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Generates a fresh random identifier.
pub fn new_id() -> String {
	uuid::Uuid::new_v4().simple().to_string()
}
