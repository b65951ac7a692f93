/// Appends bytes to a growable buffer, tracking the write position.
pub struct Writer<'a> {
	buf: &'a mut Vec<u8>,
}

impl<'a> Writer<'a> {
	pub fn new(buf: &'a mut Vec<u8>) -> Self {
		Self { buf }
	}

	#[inline]
	pub fn position(&self) -> usize {
		self.buf.len()
	}

	#[inline]
	pub fn push_u8(&mut self, b: u8) {
		self.buf.push(b);
	}

	#[inline]
	pub fn push_bytes(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Writes `value` as a minimal-length big-endian integer (leading zero bytes stripped).
	pub fn push_uint_minimal(&mut self, value: u32) {
		self.push_bytes(&minimal_be_bytes(value));
	}

	/// Reserves a single byte slot and returns its index, to be patched in later via [`Writer::patch`].
	#[inline]
	pub fn reserve_u8(&mut self) -> usize {
		let idx = self.buf.len();
		self.buf.push(0);
		idx
	}

	#[inline]
	pub fn patch(&mut self, idx: usize, b: u8) {
		self.buf[idx] = b;
	}
}

/// Returns the minimal-length big-endian encoding of `value` (empty for 0).
pub fn minimal_be_bytes(value: u32) -> Vec<u8> {
	let bytes = value.to_be_bytes();
	let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
	bytes[start..].to_vec()
}

/// Decodes a minimal-length big-endian unsigned integer. `bytes.len()` must be `<= 4`.
pub fn minimal_be_decode(bytes: &[u8]) -> u32 {
	let mut value = 0u32;
	for &b in bytes {
		value = (value << 8) | b as u32;
	}
	value
}

/// Returns the minimal-length big-endian encoding of a 64-bit `value` (empty for 0), leading
/// zero bytes stripped. Used for the CoAP token, which is carried as a 0-8 byte big-endian value.
pub fn minimal_be_bytes_u64(value: u64) -> Vec<u8> {
	let bytes = value.to_be_bytes();
	let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
	bytes[start..].to_vec()
}

/// Decodes a big-endian byte string (0-8 bytes) into a left-padded 64-bit value.
pub fn minimal_be_decode_u64(bytes: &[u8]) -> u64 {
	let mut value = 0u64;
	for &b in bytes {
		value = (value << 8) | b as u64;
	}
	value
}
