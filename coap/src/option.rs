use collections::bytes::{minimal_be_bytes, minimal_be_decode};
use log::warn;
use utils::error::*;

/// A single CoAP option as carried on the wire: a number and an opaque value.
/// Repeatable options (e.g. Uri-Path, Uri-Query, If-Match) appear as multiple entries.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Opt {
	pub number: u16,
	pub value: Vec<u8>,
}

impl Opt {
	pub fn new(number: u16, value: Vec<u8>) -> Self {
		Self { number, value }
	}
}

pub const IF_MATCH: u16 = 1;
pub const URI_HOST: u16 = 3;
pub const ETAG: u16 = 4;
pub const IF_NONE_MATCH: u16 = 5;
pub const OBSERVE: u16 = 6;
pub const URI_PORT: u16 = 7;
pub const LOCATION_PATH: u16 = 8;
pub const URI_PATH: u16 = 11;
pub const CONTENT_FORMAT: u16 = 12;
pub const MAX_AGE: u16 = 14;
pub const URI_QUERY: u16 = 15;
pub const ACCEPT: u16 = 17;
pub const LOCATION_QUERY: u16 = 20;
pub const BLOCK2: u16 = 23;
pub const BLOCK1: u16 = 27;
pub const SIZE2: u16 = 28;
pub const PROXY_URI: u16 = 35;
pub const PROXY_SCHEME: u16 = 39;
pub const SIZE1: u16 = 60;

/// A named view of a recognized option number, for logging and debug formatting. Unrecognized
/// numbers are preserved verbatim on the wire regardless of whether a name is known for them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OptionNumber {
	IfMatch,
	UriHost,
	ETag,
	IfNoneMatch,
	Observe,
	UriPort,
	LocationPath,
	UriPath,
	ContentFormat,
	MaxAge,
	UriQuery,
	Accept,
	LocationQuery,
	Block2,
	Block1,
	Size2,
	ProxyUri,
	ProxyScheme,
	Size1,
	Unknown(u16),
}

impl From<u16> for OptionNumber {
	fn from(number: u16) -> Self {
		match number {
			IF_MATCH => OptionNumber::IfMatch,
			URI_HOST => OptionNumber::UriHost,
			ETAG => OptionNumber::ETag,
			IF_NONE_MATCH => OptionNumber::IfNoneMatch,
			OBSERVE => OptionNumber::Observe,
			URI_PORT => OptionNumber::UriPort,
			LOCATION_PATH => OptionNumber::LocationPath,
			URI_PATH => OptionNumber::UriPath,
			CONTENT_FORMAT => OptionNumber::ContentFormat,
			MAX_AGE => OptionNumber::MaxAge,
			URI_QUERY => OptionNumber::UriQuery,
			ACCEPT => OptionNumber::Accept,
			LOCATION_QUERY => OptionNumber::LocationQuery,
			BLOCK2 => OptionNumber::Block2,
			BLOCK1 => OptionNumber::Block1,
			SIZE2 => OptionNumber::Size2,
			PROXY_URI => OptionNumber::ProxyUri,
			PROXY_SCHEME => OptionNumber::ProxyScheme,
			SIZE1 => OptionNumber::Size1,
			other => OptionNumber::Unknown(other),
		}
	}
}

impl From<OptionNumber> for u16 {
	fn from(name: OptionNumber) -> u16 {
		match name {
			OptionNumber::IfMatch => IF_MATCH,
			OptionNumber::UriHost => URI_HOST,
			OptionNumber::ETag => ETAG,
			OptionNumber::IfNoneMatch => IF_NONE_MATCH,
			OptionNumber::Observe => OBSERVE,
			OptionNumber::UriPort => URI_PORT,
			OptionNumber::LocationPath => LOCATION_PATH,
			OptionNumber::UriPath => URI_PATH,
			OptionNumber::ContentFormat => CONTENT_FORMAT,
			OptionNumber::MaxAge => MAX_AGE,
			OptionNumber::UriQuery => URI_QUERY,
			OptionNumber::Accept => ACCEPT,
			OptionNumber::LocationQuery => LOCATION_QUERY,
			OptionNumber::Block2 => BLOCK2,
			OptionNumber::Block1 => BLOCK1,
			OptionNumber::Size2 => SIZE2,
			OptionNumber::ProxyUri => PROXY_URI,
			OptionNumber::ProxyScheme => PROXY_SCHEME,
			OptionNumber::Size1 => SIZE1,
			OptionNumber::Unknown(n) => n,
		}
	}
}

/// RFC 7641 Observe register/deregister value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Observe {
	Register = 0,
	Deregister = 1,
}

/// A decoded Block1/Block2 option value (RFC 7959 §2.2).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockValue {
	pub num: u32,
	pub more: bool,
	pub szx: u8,
}

impl BlockValue {
	pub fn new(num: u32, more: bool, szx: u8) -> Result<Self> {
		if num >= 1 << 20 {
			warn!("Block NUM {num} exceeds the 20-bit field width");
			return Err(());
		}

		if szx > 6 {
			warn!("Block SZX {szx} is reserved or out of range");
			return Err(());
		}

		Ok(Self { num, more, szx })
	}

	/// The actual block size in bytes: `1 << (SZX + 4)`.
	pub fn size(&self) -> usize {
		1usize << (self.szx + 4)
	}

	pub(crate) fn to_bytes(self) -> Vec<u8> {
		let packed = (self.num << 4) | ((self.more as u32) << 3) | self.szx as u32;
		minimal_be_bytes(packed)
	}

	pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
		if bytes.len() > 3 {
			warn!("Block option value is longer than 3 bytes ({})", bytes.len());
			return Err(());
		}

		let packed = minimal_be_decode(bytes);
		let szx = (packed & 0x7) as u8;
		let more = (packed >> 3) & 1 != 0;
		let num = packed >> 4;

		Self::new(num, more, szx)
	}
}

fn find_all<'a>(opts: &'a [Opt], number: u16) -> impl Iterator<Item = &'a Opt> {
	opts.iter().filter(move |o| o.number == number)
}

fn find_one<'a>(opts: &'a [Opt], number: u16) -> Option<&'a Opt> {
	find_all(opts, number).next()
}

fn decode_uint(value: &[u8]) -> Option<u32> {
	if value.len() > 4 {
		warn!("Integer option value is longer than 4 bytes ({})", value.len());
		return None;
	}

	Some(minimal_be_decode(value))
}

fn decode_str(value: &[u8]) -> Option<String> {
	String::from_utf8(value.to_vec())
		.map_err(|_| warn!("Option value is not valid UTF-8"))
		.ok()
}

pub fn uri_host(opts: &[Opt]) -> Option<String> {
	decode_str(&find_one(opts, URI_HOST)?.value)
}

pub fn uri_port(opts: &[Opt]) -> Option<u16> {
	decode_uint(&find_one(opts, URI_PORT)?.value)?.try_into().ok()
}

pub fn uri_path(opts: &[Opt]) -> Vec<String> {
	find_all(opts, URI_PATH).filter_map(|o| decode_str(&o.value)).collect()
}

pub fn uri_query(opts: &[Opt]) -> Vec<String> {
	find_all(opts, URI_QUERY).filter_map(|o| decode_str(&o.value)).collect()
}

pub fn location_path(opts: &[Opt]) -> Vec<String> {
	find_all(opts, LOCATION_PATH).filter_map(|o| decode_str(&o.value)).collect()
}

pub fn location_query(opts: &[Opt]) -> Vec<String> {
	find_all(opts, LOCATION_QUERY).filter_map(|o| decode_str(&o.value)).collect()
}

pub fn observe(opts: &[Opt]) -> Option<Observe> {
	match decode_uint(&find_one(opts, OBSERVE)?.value)? {
		0 => Some(Observe::Register),
		1 => Some(Observe::Deregister),
		other => {
			warn!("Observe option has invalid value {other}");
			None
		}
	}
}

pub fn block1(opts: &[Opt]) -> Option<BlockValue> {
	BlockValue::from_bytes(&find_one(opts, BLOCK1)?.value).ok()
}

pub fn block2(opts: &[Opt]) -> Option<BlockValue> {
	BlockValue::from_bytes(&find_one(opts, BLOCK2)?.value).ok()
}

pub fn if_match(opts: &[Opt]) -> Vec<Vec<u8>> {
	find_all(opts, IF_MATCH).map(|o| o.value.clone()).collect()
}

pub fn if_none_match(opts: &[Opt]) -> bool {
	find_one(opts, IF_NONE_MATCH).is_some()
}

pub fn content_format(opts: &[Opt]) -> Option<u16> {
	decode_uint(&find_one(opts, CONTENT_FORMAT)?.value)?.try_into().ok()
}

pub fn accept(opts: &[Opt]) -> Option<u16> {
	decode_uint(&find_one(opts, ACCEPT)?.value)?.try_into().ok()
}

pub fn size1(opts: &[Opt]) -> Option<u32> {
	decode_uint(&find_one(opts, SIZE1)?.value)
}

pub fn size2(opts: &[Opt]) -> Option<u32> {
	decode_uint(&find_one(opts, SIZE2)?.value)
}

pub fn max_age(opts: &[Opt]) -> Option<u32> {
	decode_uint(&find_one(opts, MAX_AGE)?.value)
}

pub fn etag(opts: &[Opt]) -> Option<Vec<u8>> {
	find_one(opts, ETAG).map(|o| o.value.clone())
}

fn uint_opt(number: u16, value: u32) -> Opt {
	Opt::new(number, minimal_be_bytes(value))
}

pub fn make_uri_host(host: &str) -> Result<Opt> {
	if !(1..=255).contains(&host.len()) {
		warn!("Uri-Host length {} is out of range", host.len());
		return Err(());
	}

	Ok(Opt::new(URI_HOST, host.as_bytes().to_vec()))
}

pub fn make_uri_port(port: u16) -> Opt {
	uint_opt(URI_PORT, port as u32)
}

/// Validates and builds a Uri-Path segment option. A segment must be non-empty, at most 255
/// bytes, and not "." or ".." (which would be ambiguous if later interpreted as a filesystem path).
pub fn make_uri_path(segment: &str) -> Result<Opt> {
	if segment.is_empty() || segment.len() > 255 || segment == "." || segment == ".." {
		warn!("Uri-Path segment {segment:?} is invalid");
		return Err(());
	}

	Ok(Opt::new(URI_PATH, segment.as_bytes().to_vec()))
}

/// Validates and builds a Uri-Query segment option. Same constraints as [`make_uri_path`]: a
/// segment must be non-empty, at most 255 bytes, and not "." or "..".
pub fn make_uri_query(segment: &str) -> Result<Opt> {
	if segment.is_empty() || segment.len() > 255 || segment == "." || segment == ".." {
		warn!("Uri-Query segment {segment:?} is invalid");
		return Err(());
	}

	Ok(Opt::new(URI_QUERY, segment.as_bytes().to_vec()))
}

pub fn make_observe(v: Observe) -> Opt {
	uint_opt(OBSERVE, v as u32)
}

pub fn make_block1(v: BlockValue) -> Opt {
	Opt::new(BLOCK1, v.to_bytes())
}

pub fn make_block2(v: BlockValue) -> Opt {
	Opt::new(BLOCK2, v.to_bytes())
}

pub fn make_if_match(etag: &[u8]) -> Opt {
	Opt::new(IF_MATCH, etag.to_vec())
}

pub fn make_if_none_match() -> Opt {
	Opt::new(IF_NONE_MATCH, Vec::new())
}

pub fn make_content_format(v: u16) -> Opt {
	uint_opt(CONTENT_FORMAT, v as u32)
}

pub fn make_accept(v: u16) -> Opt {
	uint_opt(ACCEPT, v as u32)
}

pub fn make_size1(v: u32) -> Opt {
	uint_opt(SIZE1, v)
}

pub fn make_size2(v: u32) -> Opt {
	uint_opt(SIZE2, v)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn block_value_packs_num_more_szx() {
		let b = BlockValue::new(5, true, 3).unwrap();
		assert_eq!(b.to_bytes(), vec![(5 << 4) | (1 << 3) | 3]);
		assert_eq!(BlockValue::from_bytes(&b.to_bytes()).unwrap(), b);
	}

	#[test]
	fn block_value_rejects_reserved_szx() {
		assert!(BlockValue::new(0, false, 7).is_err());
	}

	#[test]
	fn block_value_rejects_oversized_num() {
		assert!(BlockValue::new(1 << 20, false, 0).is_err());
	}

	#[test]
	fn uri_path_rejects_dot_segments() {
		assert!(make_uri_path(".").is_err());
		assert!(make_uri_path("..").is_err());
		assert!(make_uri_path("resource").is_ok());
	}

	#[test]
	fn uri_query_rejects_dot_segments() {
		assert!(make_uri_query(".").is_err());
		assert!(make_uri_query("..").is_err());
		assert!(make_uri_query("x=1").is_ok());
	}

	#[test]
	fn accessors_round_trip() {
		let opts = vec![make_uri_host("example.com").unwrap(), make_uri_port(5683), make_observe(Observe::Register)];

		assert_eq!(uri_host(&opts).as_deref(), Some("example.com"));
		assert_eq!(uri_port(&opts), Some(5683));
		assert_eq!(observe(&opts), Some(Observe::Register));
		assert_eq!(block1(&opts), None);
	}

	#[test]
	fn uri_path_is_repeatable_and_ordered() {
		let opts = vec![make_uri_path("a").unwrap(), make_uri_path("b").unwrap(), make_uri_path("c").unwrap()];
		assert_eq!(uri_path(&opts), vec!["a", "b", "c"]);
	}
}
