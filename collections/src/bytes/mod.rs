mod reader;
mod writer;

pub use reader::Reader;
pub use writer::{minimal_be_bytes, minimal_be_bytes_u64, minimal_be_decode, minimal_be_decode_u64, Writer};
