//! Timestamp helpers shared by the binlog, recovery sys-data file and
//! replication status logging.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
pub fn now_msec() -> u64 {
	let dur = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock is before the Unix epoch");
	dur.as_secs() * 1000 + u64::from(dur.subsec_millis())
}

/// Render a millisecond timestamp as RFC3339, used in status/diagnostic
/// output (e.g. "scrub last completed at ...", "last fetch at ...").
pub fn msec_to_rfc3339(msec: u64) -> String {
	let secs = (msec / 1000) as i64;
	let nsec = ((msec % 1000) * 1_000_000) as u32;
	match chrono::DateTime::from_timestamp(secs, nsec) {
		Some(dt) => dt.to_rfc3339(),
		None => "-".to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn now_is_monotonically_plausible() {
		let a = now_msec();
		let b = now_msec();
		assert!(b >= a);
	}

	#[test]
	fn formats_known_timestamp() {
		// 2024-01-01T00:00:00Z
		let s = msec_to_rfc3339(1_704_067_200_000);
		assert!(s.starts_with("2024-01-01"));
	}
}
