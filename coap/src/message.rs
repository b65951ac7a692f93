use crate::option::Opt;

pub const VERSION: u8 = 1;

/// The 2-bit CoAP message type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Type {
	Con = 0,
	Non = 1,
	Ack = 2,
	Rst = 3,
}

impl Type {
	pub(crate) fn from_bits(b: u8) -> Self {
		match b & 0b11 {
			0 => Type::Con,
			1 => Type::Non,
			2 => Type::Ack,
			_ => Type::Rst,
		}
	}
}

/// An 8-bit CoAP code, split into a 3-bit class and 5-bit detail (`c.dd`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Code {
	pub class: u8,
	pub detail: u8,
}

impl Code {
	pub const EMPTY: Code = Code { class: 0, detail: 0 };
	pub const GET: Code = Code { class: 0, detail: 1 };
	pub const POST: Code = Code { class: 0, detail: 2 };
	pub const PUT: Code = Code { class: 0, detail: 3 };
	pub const DELETE: Code = Code { class: 0, detail: 4 };

	pub const CREATED: Code = Code { class: 2, detail: 1 };
	pub const DELETED: Code = Code { class: 2, detail: 2 };
	pub const VALID: Code = Code { class: 2, detail: 3 };
	pub const CHANGED: Code = Code { class: 2, detail: 4 };
	pub const CONTENT: Code = Code { class: 2, detail: 5 };
	pub const CONTINUE: Code = Code { class: 2, detail: 31 };

	pub const fn is_empty(self) -> bool {
		self.class == 0 && self.detail == 0
	}

	/// Whether this code falls in the request class (0.01-0.31, excluding Empty).
	pub const fn is_request(self) -> bool {
		self.class == 0 && self.detail != 0
	}

	/// Whether this code's class is one RFC 7252 §12.1 actually defines (0 request, 2/4/5
	/// response); classes 1, 3, 6, 7 are reserved.
	pub const fn has_valid_class(self) -> bool {
		matches!(self.class, 0 | 2 | 4 | 5)
	}

	pub(crate) const fn to_byte(self) -> u8 {
		(self.class << 5) | (self.detail & 0x1f)
	}

	pub(crate) const fn from_byte(b: u8) -> Self {
		Code { class: b >> 5, detail: b & 0x1f }
	}
}

/// The subset of request codes the application submits through the typed `request` API.
/// `request_raw` accepts arbitrary codes instead, per spec §6.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Method {
	Get,
	Post,
	Put,
	Delete,
}

impl Method {
	pub(crate) fn code(self) -> Code {
		match self {
			Method::Get => Code::GET,
			Method::Post => Code::POST,
			Method::Put => Code::PUT,
			Method::Delete => Code::DELETE,
		}
	}
}

/// The canonical in-memory form of one CoAP datagram (spec §3).
#[derive(Clone, PartialEq, Debug)]
pub struct CoapMessage {
	pub ty: Type,
	pub code: Code,
	pub message_id: u16,
	/// Carried as a 64-bit value; leading zero bytes are stripped on the wire (0 => no token).
	pub token: u64,
	pub options: Vec<Opt>,
	pub payload: Vec<u8>,
}

impl CoapMessage {
	/// An Empty message: Code 0.00, no token, no options, no payload (4 bytes on the wire).
	pub fn empty(ty: Type, message_id: u16) -> Self {
		Self { ty, code: Code::EMPTY, message_id, token: 0, options: Vec::new(), payload: Vec::new() }
	}

	pub fn ack(message_id: u16) -> Self {
		Self::empty(Type::Ack, message_id)
	}

	pub fn rst(message_id: u16) -> Self {
		Self::empty(Type::Rst, message_id)
	}

	pub fn is_piggybacked_response(&self) -> bool {
		self.ty == Type::Ack && !self.code.is_empty()
	}
}
