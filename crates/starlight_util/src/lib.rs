#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `http://host:port` listen endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct HttpEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl HttpEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse `http://host:port`; a bare `host:port` is accepted too.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected http://host:port)".to_string());
			}

			let rest = s.strip_prefix("http://").unwrap_or(s);

			if rest.contains("://") || rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected http://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected http://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected http://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like http://[::1]:3000): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	/// Join an externally reachable base URL and an absolute path, tolerating a trailing `/` on the base.
	pub fn public_url(base_url: &str, path: &str) -> String {
		let base = base_url.trim().trim_end_matches('/');
		let path = path.trim_start_matches('/');
		format!("{base}/{path}")
	}

}

pub mod clock {
	use std::fmt;
	use std::sync::atomic::{AtomicI64, Ordering};
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}

	/// Wall-clock source, injectable so expiry and TTL logic can be driven in tests.
	pub trait Clock: Send + Sync + fmt::Debug {
		fn now_ms(&self) -> i64;
	}

	#[derive(Debug, Clone, Copy, Default)]
	pub struct SystemClock;

	impl Clock for SystemClock {
		fn now_ms(&self) -> i64 {
			unix_ms_now()
		}
	}

	/// Manually advanced clock.
	#[derive(Debug, Default)]
	pub struct ManualClock {
		now: AtomicI64,
	}

	impl ManualClock {
		pub fn new(start_ms: i64) -> Self {
			Self {
				now: AtomicI64::new(start_ms),
			}
		}

		pub fn set(&self, ms: i64) {
			self.now.store(ms, Ordering::SeqCst);
		}

		pub fn advance(&self, by: Duration) {
			self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
		}
	}

	impl Clock for ManualClock {
		fn now_ms(&self) -> i64 {
			self.now.load(Ordering::SeqCst)
		}
	}

}

pub mod text {
	/// Truncate to at most `max_chars` characters without splitting a code point.
	pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
		match s.char_indices().nth(max_chars) {
			Some((idx, _)) => &s[..idx],
			None => s,
		}
	}

}
