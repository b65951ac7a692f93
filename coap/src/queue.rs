use std::collections::VecDeque;

use hashbrown::HashSet;
use log::warn;

use crate::message::{Code, CoapMessage, Type};
use crate::option::{self, BlockValue, Observe, Opt};

/// The caller-supplied shape of a logical request, used by a [`Queue::dynamic`] to generate
/// the head message and every Block1 continuation (spec §4.3).
#[derive(Clone, Debug)]
pub struct RequestTemplate {
	pub method: Code,
	pub options: Vec<Opt>,
	pub observe: bool,
	pub payload: Vec<u8>,
}

struct Dynamic {
	template: RequestTemplate,
	cut_position: usize,
}

/// Either a caller-provided fixed list of messages (`request_raw`) or a template-driven
/// generator that slices a payload into Block1 chunks on demand (spec §4.3).
pub struct Queue {
	pub token: u64,
	pub ty: Type,
	pending: VecDeque<CoapMessage>,
	acked: HashSet<u16>,
	dynamic: Option<Dynamic>,
}

pub(crate) fn fresh_message_id() -> u16 {
	rand::random()
}

impl Queue {
	pub fn preset(token: u64, ty: Type, messages: Vec<CoapMessage>) -> Self {
		Self { token, ty, pending: messages.into(), acked: HashSet::new(), dynamic: None }
	}

	pub fn dynamic(token: u64, ty: Type, template: RequestTemplate) -> Self {
		Self {
			token,
			ty,
			pending: VecDeque::new(),
			acked: HashSet::new(),
			dynamic: Some(Dynamic { template, cut_position: 0 }),
		}
	}

	/// The first not-yet-acked queued message, if any.
	pub fn next(&self) -> Option<&CoapMessage> {
		self.pending.iter().find(|m| !self.acked.contains(&m.message_id))
	}

	/// Marks `message_id` as acknowledged and removes it from the pending list.
	pub fn dequeue(&mut self, message_id: u16) {
		self.acked.insert(message_id);
		self.pending.retain(|m| m.message_id != message_id);
	}

	pub fn contains(&self, message_id: u16) -> bool {
		self.pending.iter().any(|m| m.message_id == message_id)
	}

	/// Appends an arbitrary message (an ACK, a block2 continuation, a deregister) to the queue.
	pub fn enqueue(&mut self, message: CoapMessage) {
		self.pending.push_back(message);
	}

	pub fn reset(&mut self) {
		self.pending.clear();
		self.acked.clear();
		if let Some(d) = &mut self.dynamic {
			d.cut_position = 0;
		}
	}

	/// Builds and enqueues the next outgoing block for a dynamic queue; a no-op for a preset
	/// queue, whose caller owns chunking.
	pub fn enqueue_block(&mut self, num: u32, szx: u8) {
		let Some(dynamic) = &mut self.dynamic else { return };
		let block_size = BlockValue { num: 0, more: false, szx }.size();
		let total = dynamic.template.payload.len();

		if num == 0 {
			let end = block_size.min(total);
			let more = end < total;
			let spans_multiple = total > block_size;

			let mut options = dynamic.template.options.clone();
			if dynamic.template.observe {
				options.push(option::make_observe(Observe::Register));
			}
			if spans_multiple {
				let Ok(block1) = BlockValue::new(0, more, szx) else {
					warn!("cannot start a Block1 transfer: SZX {szx} is out of range");
					return;
				};
				options.push(option::make_block1(block1));
			}

			self.pending.push_back(CoapMessage {
				ty: self.ty,
				code: dynamic.template.method,
				message_id: fresh_message_id(),
				token: self.token,
				options,
				payload: dynamic.template.payload[..end].to_vec(),
			});

			dynamic.cut_position = end;
			return;
		}

		if dynamic.cut_position >= total {
			return;
		}

		let start = dynamic.cut_position;
		let end = (start + block_size).min(total);
		let more = end < total;

		// `num` is the server-echoed prior Block1 NUM plus one (session.rs); a malicious or
		// buggy peer can drive it past the 20-bit field width. Drop the continuation rather than
		// panicking or re-enqueuing the same block forever (spec §7: format errors are logged
		// and dropped, never fatal to the connection).
		let Ok(block1) = BlockValue::new(num, more, szx) else {
			warn!("dropping Block1 continuation: NUM {num} exceeds the 20-bit field width");
			return;
		};

		self.pending.push_back(CoapMessage {
			ty: self.ty,
			code: dynamic.template.method,
			message_id: fresh_message_id(),
			token: self.token,
			options: vec![option::make_block1(block1)],
			payload: dynamic.template.payload[start..end].to_vec(),
		});

		dynamic.cut_position = end;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message::Code;

	fn template(payload: Vec<u8>) -> RequestTemplate {
		RequestTemplate { method: Code::GET, options: Vec::new(), observe: false, payload }
	}

	#[test]
	fn dynamic_single_block_omits_block1() {
		let mut q = Queue::dynamic(1, Type::Con, template(b"short".to_vec()));
		q.enqueue_block(0, 6);
		let head = q.next().unwrap();
		assert!(option::block1(&head.options).is_none());
		assert_eq!(head.payload, b"short");
	}

	#[test]
	fn dynamic_multi_block_chunks_and_advances_cursor() {
		let payload = vec![0u8; 40];
		let mut q = Queue::dynamic(1, Type::Con, template(payload));
		q.enqueue_block(0, 0); // szx=0 => 16-byte blocks
		let head = q.next().unwrap().clone();
		let b = option::block1(&head.options).unwrap();
		assert_eq!((b.num, b.more), (0, true));
		assert_eq!(head.payload.len(), 16);

		q.dequeue(head.message_id);
		q.enqueue_block(1, 0);
		let second = q.next().unwrap();
		let b = option::block1(&second.options).unwrap();
		assert_eq!((b.num, b.more), (1, true));
	}

	#[test]
	fn dynamic_stops_once_payload_exhausted() {
		let mut q = Queue::dynamic(1, Type::Con, template(b"short".to_vec()));
		q.enqueue_block(0, 6);
		q.dequeue(q.next().unwrap().message_id);
		q.enqueue_block(1, 6);
		assert!(q.next().is_none());
	}

	/// A NUM that has reached the 20-bit field width is dropped (logged, no panic, nothing
	/// enqueued) rather than crashing or wedging the transfer.
	#[test]
	fn dynamic_drops_block_when_num_overflows_instead_of_panicking() {
		let mut q = Queue::dynamic(1, Type::Con, template(vec![0u8; 40]));
		q.enqueue_block(1 << 20, 0);
		assert!(q.next().is_none());
	}

	#[test]
	fn preset_skips_acked_entries() {
		let messages = vec![
			CoapMessage { ty: Type::Con, code: Code::GET, message_id: 1, token: 1, options: Vec::new(), payload: Vec::new() },
			CoapMessage { ty: Type::Con, code: Code::GET, message_id: 2, token: 1, options: Vec::new(), payload: Vec::new() },
		];
		let mut q = Queue::preset(1, Type::Con, messages);
		assert_eq!(q.next().unwrap().message_id, 1);
		q.dequeue(1);
		assert_eq!(q.next().unwrap().message_id, 2);
	}
}
