//! Error kinds shared by the index, trunk allocator, binlog, replication,
//! recovery and client subsystems.

use std::borrow::Cow;
use std::io;

use err_derive::Error;

/// The single error type threaded through the core. Each variant maps to
/// one kind named here; `wire_code`/`from_wire_code` implement the
/// POSIX-errno-reuse scheme used on the wire.
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "not found")]
	NotFound,
	#[error(display = "already exists")]
	Exists,
	#[error(display = "no space left")]
	NoSpace,
	#[error(display = "no memory")]
	NoMemory,
	#[error(display = "I/O error: {}", _0)]
	Io(#[error(source)] io::Error),
	#[error(display = "busy")]
	Busy,
	#[error(display = "retriable: {}", _0)]
	Retriable(Cow<'static, str>),
	#[error(display = "idempotency channel invalid")]
	ChannelInvalid,
	#[error(display = "protocol error: {}", _0)]
	Protocol(Cow<'static, str>),
	#[error(display = "cancelled")]
	Cancelled,
	#[error(display = "invalid: {}", _0)]
	Invalid(Cow<'static, str>),
	#[error(display = "overflow")]
	Overflow,
	#[error(display = "no data")]
	NoData,
	/// Non-blocking allocation request found the target freelist momentarily
	/// empty; the caller should retry.
	#[error(display = "again")]
	Again,
	#[error(display = "{}", _0)]
	Message(Cow<'static, str>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	pub fn message<S: Into<Cow<'static, str>>>(s: S) -> Self {
		Error::Message(s.into())
	}

	/// Maps an error to the wire extension-namespace code.
	/// Values above 200 are this project's extension range; values below
	/// reuse POSIX errno numbers where a natural equivalent exists.
	pub fn wire_code(&self) -> u8 {
		match self {
			Error::NotFound => 2,      // ENOENT
			Error::Exists => 17,       // EEXIST
			Error::NoSpace => 28,      // ENOSPC
			Error::NoMemory => 12,     // ENOMEM
			Error::Io(_) => 5,         // EIO
			Error::Busy => 16,         // EBUSY
			Error::Retriable(_) => 200,
			Error::ChannelInvalid => 201,
			Error::Protocol(_) => 202,
			Error::Cancelled => 203,
			Error::Invalid(_) => 22,   // EINVAL
			Error::Overflow => 75,     // EOVERFLOW
			Error::NoData => 204,
			Error::Again => 11,        // EAGAIN
			Error::Message(_) => 205,
		}
	}

	pub fn from_wire_code(code: u8) -> Self {
		match code {
			2 => Error::NotFound,
			17 => Error::Exists,
			28 => Error::NoSpace,
			12 => Error::NoMemory,
			5 => Error::Io(io::Error::new(io::ErrorKind::Other, "remote I/O error")),
			16 => Error::Busy,
			200 => Error::Retriable("remote retriable error".into()),
			201 => Error::ChannelInvalid,
			202 => Error::Protocol("remote protocol error".into()),
			203 => Error::Cancelled,
			22 => Error::Invalid("remote invalid argument".into()),
			75 => Error::Overflow,
			204 => Error::NoData,
			11 => Error::Again,
			_ => Error::Message(format!("remote error code {}", code).into()),
		}
	}

	/// True for errors that are ordinary data-plane outcomes and must not
	/// be logged as errors.
	pub fn is_data_plane(&self) -> bool {
		matches!(self, Error::NotFound | Error::Exists | Error::NoData)
	}
}

/// Like `Option::ok_or`, but producing this crate's error type with a
/// short static message — used pervasively the way
/// `garage_util::error::OkOrMessage` is used in the grounding crate.
pub trait OkOrMessage<T> {
	fn ok_or_message<S: Into<Cow<'static, str>>>(self, msg: S) -> Result<T>;
}

impl<T> OkOrMessage<T> for Option<T> {
	fn ok_or_message<S: Into<Cow<'static, str>>>(self, msg: S) -> Result<T> {
		self.ok_or_else(|| Error::message(msg))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wire_code_roundtrip_for_stable_kinds() {
		for e in [
			Error::NotFound,
			Error::Exists,
			Error::NoSpace,
			Error::NoMemory,
			Error::Busy,
			Error::ChannelInvalid,
			Error::Cancelled,
			Error::NoData,
			Error::Again,
		] {
			let code = e.wire_code();
			let back = Error::from_wire_code(code);
			assert_eq!(back.wire_code(), code);
		}
	}

	#[test]
	fn data_plane_errors_are_not_logged_as_failures() {
		assert!(Error::NotFound.is_data_plane());
		assert!(Error::Exists.is_data_plane());
		assert!(!Error::Io(io::Error::new(io::ErrorKind::Other, "x")).is_data_plane());
	}
}
