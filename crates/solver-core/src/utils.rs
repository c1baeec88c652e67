//! # Core Utilities
//!
//! Formatting helpers shared by the orchestrator's log output.

/// Shortens a digest or other long identifier for log lines.
///
/// The algorithm prefix of a digest is dropped and the remaining hex is
/// shown as its first 6 and last 4 characters, e.g.
/// `sha256:2cf24dba...9824` becomes `2cf24d...9824`. Identifiers of 12
/// characters or fewer are returned unchanged.
pub fn truncate_digest(digest: &str) -> String {
	let encoded = digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest);
	if encoded.len() <= 12 || !encoded.is_ascii() {
		encoded.to_string()
	} else {
		format!("{}...{}", &encoded[..6], &encoded[encoded.len() - 4..])
	}
}
