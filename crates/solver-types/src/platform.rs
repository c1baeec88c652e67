//! Target platform descriptions (`os/arch[/variant]`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
	pub os: String,
	pub architecture: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub variant: Option<String>,
}

impl Platform {
	pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
		Self {
			os: os.into(),
			architecture: architecture.into(),
			variant: None,
		}
	}

	pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
		self.variant = Some(variant.into());
		self
	}

	/// The platform of the running host, using OCI architecture names.
	pub fn host() -> Self {
		let arch = match std::env::consts::ARCH {
			"x86_64" => "amd64",
			"aarch64" => "arm64",
			"x86" => "386",
			other => other,
		};
		Self::new(std::env::consts::OS, arch)
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.variant {
			Some(variant) => write!(f, "{}/{}/{}", self.os, self.architecture, variant),
			None => write!(f, "{}/{}", self.os, self.architecture),
		}
	}
}

impl FromStr for Platform {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let parts: Vec<&str> = s.split('/').collect();
		match parts.as_slice() {
			[os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Platform::new(*os, *arch)),
			[os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
				Ok(Platform::new(*os, *arch).with_variant(*variant))
			}
			_ => Err(format!("invalid platform: {}", s)),
		}
	}
}
