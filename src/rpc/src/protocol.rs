//! Wire protocol: a fixed header followed by a command-specific
//! body. All integers are big-endian; `bytes::Buf`/`BufMut` already encode
//! that way by default, so no extra byte-order crate is needed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use dfs_util::error::{Error, Result};

pub const HEADER_LEN: usize = 1 + 1 + 4 + 8;

/// Core wire commands. `cmd` is sent as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
	SliceWrite = 1,
	SliceRead = 2,
	BlockDelete = 3,
	BlockSliceDelete = 4,
	ClusterStat = 5,
	ReplicaActiveConfirm = 6,
	ReplicaBinlogFetch = 7,
}

impl Command {
	pub fn from_u8(v: u8) -> Result<Self> {
		Ok(match v {
			1 => Command::SliceWrite,
			2 => Command::SliceRead,
			3 => Command::BlockDelete,
			4 => Command::BlockSliceDelete,
			5 => Command::ClusterStat,
			6 => Command::ReplicaActiveConfirm,
			7 => Command::ReplicaBinlogFetch,
			other => return Err(Error::Protocol(format!("unknown command byte {}", other).into())),
		})
	}
}

/// `FSProtoHeader { cmd:u8, status:u8, body_len:u32, req_id:u64 }`.
/// `status` is `0` on a request and an error `wire_code` (or `0` for
/// success) on a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsProtoHeader {
	pub cmd: u8,
	pub status: u8,
	pub body_len: u32,
	pub req_id: u64,
}

impl FsProtoHeader {
	pub fn request(cmd: Command, req_id: u64, body_len: u32) -> Self {
		Self {
			cmd: cmd as u8,
			status: 0,
			body_len,
			req_id,
		}
	}

	pub fn response(cmd: Command, req_id: u64, body_len: u32, status: u8) -> Self {
		Self {
			cmd: cmd as u8,
			status,
			body_len,
			req_id,
		}
	}

	pub fn is_success(&self) -> bool {
		self.status == 0
	}

	pub fn encode(&self) -> Bytes {
		let mut buf = BytesMut::with_capacity(HEADER_LEN);
		buf.put_u8(self.cmd);
		buf.put_u8(self.status);
		buf.put_u32(self.body_len);
		buf.put_u64(self.req_id);
		buf.freeze()
	}

	pub fn decode(mut buf: impl Buf) -> Result<Self> {
		if buf.remaining() < HEADER_LEN {
			return Err(Error::Protocol("short header".into()));
		}
		Ok(Self {
			cmd: buf.get_u8(),
			status: buf.get_u8(),
			body_len: buf.get_u32(),
			req_id: buf.get_u64(),
		})
	}
}
