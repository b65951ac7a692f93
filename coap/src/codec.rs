use crate::message::{Code, CoapMessage, Type, VERSION};
use crate::option::Opt;
use collections::bytes::{minimal_be_bytes_u64, minimal_be_decode_u64, Reader, Writer};
use log::warn;
use utils::error::*;

const PAYLOAD_MARKER: u8 = 0xff;

/// Serializes a message into a fresh buffer per RFC 7252 §3.
pub fn encode(msg: &CoapMessage) -> Vec<u8> {
	let mut buf = Vec::with_capacity(32);
	let mut w = Writer::new(&mut buf);

	let token = minimal_be_bytes_u64(msg.token);
	debug_assert!(token.len() <= 8);

	w.push_u8((VERSION << 6) | ((msg.ty as u8) << 4) | token.len() as u8);
	w.push_u8(msg.code.to_byte());
	w.push_u8((msg.message_id >> 8) as u8);
	w.push_u8(msg.message_id as u8);
	w.push_bytes(&token);

	if msg.code.is_empty() {
		return buf;
	}

	let mut options = msg.options.clone();
	options.sort_by_key(|o| o.number);
	encode_options(&mut w, &options);

	if !msg.payload.is_empty() {
		w.push_u8(PAYLOAD_MARKER);
		w.push_bytes(&msg.payload);
	}

	buf
}

fn encode_options(w: &mut Writer, options: &[Opt]) {
	let mut last_number = 0u16;

	for opt in options {
		let delta = opt.number - last_number;
		last_number = opt.number;
		let length = opt.value.len();

		let (delta_nibble, delta_ext) = encode_ext(delta as u32);
		let (length_nibble, length_ext) = encode_ext(length as u32);

		w.push_u8((delta_nibble << 4) | length_nibble);
		w.push_bytes(&delta_ext);
		w.push_bytes(&length_ext);
		w.push_bytes(&opt.value);
	}
}

/// Encodes a delta or length value into its 4-bit nibble plus 0/1/2 extension bytes.
fn encode_ext(value: u32) -> (u8, Vec<u8>) {
	if value < 13 {
		(value as u8, Vec::new())
	} else if value < 269 {
		(13, vec![(value - 13) as u8])
	} else {
		let v = value - 269;
		(14, vec![(v >> 8) as u8, v as u8])
	}
}

/// Parses a single datagram into a message, or a format error (spec §7: logged and dropped by the caller).
pub fn decode(buf: &[u8]) -> Result<CoapMessage> {
	if buf.len() < 4 {
		warn!("CoAP datagram shorter than the 4-byte header ({} bytes)", buf.len());
		return Err(());
	}

	let mut r = Reader::new(buf);
	let first = r.read_u8().unwrap();
	let version = first >> 6;
	if version != VERSION {
		warn!("unsupported CoAP version {version}");
		return Err(());
	}

	let ty = Type::from_bits(first >> 4);
	let token_length = (first & 0x0f) as usize;
	if token_length > 8 {
		warn!("token length {token_length} exceeds 8 bytes");
		return Err(());
	}

	let code = Code::from_byte(r.read_u8().unwrap());
	let message_id = ((r.read_u8().unwrap() as u16) << 8) | r.read_u8().unwrap() as u16;

	if code.is_empty() {
		if buf.len() != 4 || token_length != 0 {
			warn!("Empty message must be exactly 4 bytes with no token");
			return Err(());
		}

		return Ok(CoapMessage { ty, code, message_id, token: 0, options: Vec::new(), payload: Vec::new() });
	}

	let token_bytes = r.read_bytes(token_length).ok_or_else(|| warn!("truncated token"))?;
	let token = minimal_be_decode_u64(token_bytes);

	let (options, payload) = decode_options_and_payload(&mut r)?;

	Ok(CoapMessage { ty, code, message_id, token, options, payload })
}

fn decode_options_and_payload(r: &mut Reader) -> Result<(Vec<Opt>, Vec<u8>)> {
	let mut options = Vec::new();
	let mut last_number = 0u16;

	loop {
		match r.peek_u8() {
			None => return Ok((options, Vec::new())),
			Some(PAYLOAD_MARKER) => {
				r.read_u8();
				if r.is_empty() {
					warn!("payload marker present with zero-length payload");
					return Err(());
				}
				return Ok((options, r.rest().to_vec()));
			}
			Some(first) => {
				r.read_u8();
				let delta_nibble = first >> 4;
				let length_nibble = first & 0x0f;

				let delta = decode_ext(r, delta_nibble)?;
				let length = decode_ext(r, length_nibble)? as usize;

				let number = last_number + delta as u16;
				last_number = number;

				let value = r.read_bytes(length).ok_or_else(|| warn!("option value runs past end of buffer"))?;
				options.push(Opt::new(number, value.to_vec()));
			}
		}
	}
}

fn decode_ext(r: &mut Reader, nibble: u8) -> Result<u32> {
	match nibble {
		0..=12 => Ok(nibble as u32),
		13 => {
			let ext = r.read_u8().ok_or_else(|| warn!("truncated 1-byte option extension"))?;
			Ok(ext as u32 + 13)
		}
		14 => {
			let hi = r.read_u8().ok_or_else(|| warn!("truncated 2-byte option extension"))?;
			let lo = r.read_u8().ok_or_else(|| warn!("truncated 2-byte option extension"))?;
			Ok((((hi as u32) << 8) | lo as u32) + 269)
		}
		_ => {
			warn!("reserved option nibble 15 encountered");
			Err(())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message::Method;

	#[test]
	fn minimal_get_encode() {
		let msg = CoapMessage {
			ty: Type::Con,
			code: Method::Get.code(),
			message_id: 0,
			token: 1,
			options: Vec::new(),
			payload: Vec::new(),
		};

		assert_eq!(encode(&msg), vec![0x41, 0x01, 0x00, 0x00, 0x01]);
	}

	#[test]
	fn get_with_three_options_encode() {
		let msg = CoapMessage {
			ty: Type::Con,
			code: Method::Get.code(),
			message_id: 0,
			token: 1,
			options: vec![
				Opt::new(crate::option::ETAG, vec![3]),
				Opt::new(crate::option::IF_NONE_MATCH, vec![5]),
				Opt::new(crate::option::OBSERVE, vec![10]),
			],
			payload: Vec::new(),
		};

		assert_eq!(encode(&msg), vec![0x41, 0x01, 0x00, 0x00, 0x01, 0x41, 0x03, 0x10, 0x05, 0x11, 0x0A]);
	}

	#[test]
	fn get_with_payload_encode() {
		let msg = CoapMessage {
			ty: Type::Con,
			code: Method::Get.code(),
			message_id: 0,
			token: 1000,
			options: Vec::new(),
			payload: b"Hello, there!".to_vec(),
		};

		let bytes = encode(&msg);
		assert_eq!(&bytes[..7], &[0x42, 0x01, 0x00, 0x00, 0x03, 0xE8, 0xFF]);
		assert_eq!(&bytes[7..], b"Hello, there!");
	}

	#[test]
	fn empty_message_encode() {
		let msg = CoapMessage::ack(0x1234);
		assert_eq!(encode(&msg), vec![0x60, 0x00, 0x12, 0x34]);
	}

	#[test]
	fn decode_rejects_short_buffer() {
		assert!(decode(&[0x40, 0x01, 0x00]).is_err());
	}

	#[test]
	fn decode_rejects_bad_version() {
		assert!(decode(&[0x01, 0x01, 0x00, 0x00]).is_err());
	}

	#[test]
	fn decode_rejects_nonempty_empty_code_message() {
		assert!(decode(&[0x60, 0x00, 0x12, 0x34, 0x00]).is_err());
	}

	#[test]
	fn decode_rejects_trailing_payload_marker() {
		assert!(decode(&[0x40, 0x01, 0x00, 0x00, 0xff]).is_err());
	}

	#[test]
	fn round_trip_is_exact() {
		let msg = CoapMessage {
			ty: Type::Non,
			code: crate::message::Code::CONTENT,
			message_id: 42,
			token: 0x0102030405,
			options: vec![Opt::new(crate::option::URI_PATH, b"a".to_vec()), Opt::new(crate::option::URI_PATH, b"b".to_vec())],
			payload: b"payload".to_vec(),
		};

		assert_eq!(decode(&encode(&msg)).unwrap(), msg);
	}
}
