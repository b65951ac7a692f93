use std::collections::BTreeMap;

/// Accumulates Block2 response fragments for one session and concatenates them once every
/// block from 0 up to the final one (the one with `more == false`) has been seen (spec §8).
#[derive(Default)]
pub struct ReassemblyBuffer {
	fragments: BTreeMap<u32, Vec<u8>>,
	final_num: Option<u32>,
}

impl ReassemblyBuffer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, num: u32, payload: Vec<u8>, more: bool) {
		self.fragments.insert(num, payload);
		if !more {
			self.final_num = Some(num);
		}
	}

	/// Returns the concatenated payload if every block from 0 to the final one is present.
	/// Never emits a partial result.
	pub fn try_reassemble(&self) -> Option<Vec<u8>> {
		let final_num = self.final_num?;

		let mut out = Vec::new();
		for num in 0..=final_num {
			out.extend_from_slice(self.fragments.get(&num)?);
		}

		Some(out)
	}

	pub fn reset(&mut self) {
		self.fragments.clear();
		self.final_num = None;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reassembles_in_order_once_complete() {
		let mut buf = ReassemblyBuffer::new();
		buf.insert(1, b"world".to_vec(), false);
		assert_eq!(buf.try_reassemble(), None);
		buf.insert(0, b"hello ".to_vec(), true);
		assert_eq!(buf.try_reassemble(), Some(b"hello world".to_vec()));
	}

	#[test]
	fn never_emits_with_a_missing_block() {
		let mut buf = ReassemblyBuffer::new();
		buf.insert(0, b"a".to_vec(), true);
		buf.insert(2, b"c".to_vec(), false);
		assert_eq!(buf.try_reassemble(), None);
	}
}
