use log::warn;

use crate::error::Fail;
use crate::message::{Code, CoapMessage, Type};
use crate::option::{self, BlockValue};
use crate::queue::{fresh_message_id, Queue, RequestTemplate};
use crate::reassembly::ReassemblyBuffer;

/// Session state (spec §4.4 state machine summary).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Lifecycle {
	Sending,
	Awaiting,
	Completed,
	Cancelled,
	Failed,
}

/// What a Session hands back to the application sink.
#[derive(Clone, Debug)]
pub enum SessionEvent {
	/// One inbound message, forwarded verbatim (duplicates already coalesced).
	Message(CoapMessage),
	/// The full Block2 response body, in NUM order, once every fragment has arrived.
	Reassembled(Vec<u8>),
	Finished,
	Cancelled,
	Failed(Fail),
}

/// What the Connection must do as a result of feeding one inbound message to a session.
#[derive(Default)]
pub struct SessionOutcome {
	/// Messages to hand to the transport right away (ACKs, NON continuations) rather than
	/// through the session's own retransmission queue.
	pub immediate: Vec<CoapMessage>,
	/// A new connection-wide Block1 SZX preference, if this inbound carried Block1.
	pub new_block1_szx: Option<u8>,
}

/// Where a Session delivers its events. A plain boxed closure rather than `stakker::Fwd`
/// directly: Session is not an actor and has no dependency on a running `Stakker` core, so its
/// unit tests can drive it without one. The Connection actor wraps its caller-supplied
/// `Fwd<SessionEvent>` in one of these when it starts a session.
pub type Sink = Box<dyn FnMut(SessionEvent)>;

/// Per-token request state, owned by the Connection (spec §4.4). Not an actor: the Connection's
/// event loop is the only thing that ever touches it, so a plain struct in a token-keyed map
/// avoids the overhead of one actor per outstanding request.
pub struct Session {
	pub token: u64,
	initial_type: Type,
	queue: Queue,
	reassembly: ReassemblyBuffer,
	is_observe: bool,
	lifecycle: Lifecycle,
	last_inbound: Option<CoapMessage>,
	sink: Sink,
}

impl Session {
	/// Starts a session from a logical request template, asking the queue for the head message.
	pub fn start(token: u64, ty: Type, template: RequestTemplate, block1_szx: u8, sink: Sink) -> Self {
		let is_observe = template.observe;
		let mut queue = Queue::dynamic(token, ty, template);
		queue.enqueue_block(0, block1_szx);

		Self { token, initial_type: ty, queue, reassembly: ReassemblyBuffer::new(), is_observe, lifecycle: Lifecycle::Sending, last_inbound: None, sink }
	}

	/// Starts a session from a caller-provided list of raw messages (`request_raw`).
	pub fn start_raw(token: u64, ty: Type, messages: Vec<CoapMessage>, sink: Sink) -> Self {
		let queue = Queue::preset(token, ty, messages);
		Self { token, initial_type: ty, queue, reassembly: ReassemblyBuffer::new(), is_observe: false, lifecycle: Lifecycle::Sending, last_inbound: None, sink }
	}

	pub fn lifecycle(&self) -> Lifecycle {
		self.lifecycle
	}

	/// The front of the retransmission queue: resend if CON, send-and-dequeue if NON.
	pub fn front(&self) -> Option<&CoapMessage> {
		self.queue.next()
	}

	pub fn dequeue(&mut self, message_id: u16) {
		self.queue.dequeue(message_id);
	}

	pub fn contains(&self, message_id: u16) -> bool {
		self.queue.contains(message_id)
	}

	/// Applies spec §4.4's inbound-handling steps 1-7 to one decoded message matching this
	/// session's token or queue.
	pub fn handle_inbound(&mut self, msg: CoapMessage) -> SessionOutcome {
		let mut outcome = SessionOutcome::default();

		if msg.ty == Type::Con {
			outcome.immediate.push(CoapMessage::ack(msg.message_id));
		}

		let duplicate = self.last_inbound.as_ref() == Some(&msg);
		self.last_inbound = Some(msg.clone());
		if duplicate {
			return outcome;
		}

		if self.initial_type == Type::Con && msg.ty == Type::Ack {
			self.queue.dequeue(msg.message_id);
			if msg.code.is_empty() {
				self.lifecycle = Lifecycle::Awaiting;
				return outcome;
			}
		}

		if msg.ty == Type::Rst {
			self.finish();
			return outcome;
		}

		(self.sink)(SessionEvent::Message(msg.clone()));

		let block2 = option::block2(&msg.options);
		if let Some(b2) = block2 {
			if b2.num == 0 {
				self.reassembly.reset();
			}

			self.reassembly.insert(b2.num, msg.payload.clone(), b2.more);
			if let Some(whole) = self.reassembly.try_reassemble() {
				(self.sink)(SessionEvent::Reassembled(whole));
				self.reassembly.reset();
			}

			if b2.more {
				// `b2.num + 1` comes from the server's own echoed NUM and can reach the 20-bit
				// field width. Drop the continuation instead of falling back to `b2` (which would
				// re-request the same block forever) or panicking (spec §7: format errors are
				// logged and dropped, never fatal to the connection).
				match BlockValue::new(b2.num + 1, false, b2.szx) {
					Ok(next) => {
						let continuation = CoapMessage {
							ty: self.initial_type,
							code: Code::GET,
							message_id: fresh_message_id(),
							token: self.token,
							options: vec![option::make_block2(next)],
							payload: Vec::new(),
						};

						if self.initial_type == Type::Con {
							self.queue.enqueue(continuation);
						} else {
							outcome.immediate.push(continuation);
						}
					}
					Err(()) => {
						warn!("dropping Block2 continuation: NUM {} exceeds the 20-bit field width", b2.num + 1);
					}
				}
			}
		}

		if let Some(b1) = option::block1(&msg.options) {
			outcome.new_block1_szx = Some(b1.szx);
			self.queue.enqueue_block(b1.num + 1, b1.szx);
		}

		let more_block2_expected = block2.map(|b| b.more).unwrap_or(false);
		if !self.is_observe && !more_block2_expected && self.queue.next().is_none() {
			self.finish();
		} else {
			self.lifecycle = Lifecycle::Sending;
		}

		outcome
	}

	fn finish(&mut self) {
		self.lifecycle = Lifecycle::Completed;
		(self.sink)(SessionEvent::Finished);
	}

	pub fn fail(&mut self, kind: Fail) {
		self.lifecycle = Lifecycle::Failed;
		(self.sink)(SessionEvent::Failed(kind));
	}

	/// Cancels the session: deregisters an active observation and tells the sink.
	pub fn cancel(&mut self) -> Option<CoapMessage> {
		self.lifecycle = Lifecycle::Cancelled;
		(self.sink)(SessionEvent::Cancelled);
		self.queue.reset();

		self.is_observe.then(|| CoapMessage {
			ty: Type::Non,
			code: Code::GET,
			message_id: fresh_message_id(),
			token: self.token,
			options: vec![option::make_observe(option::Observe::Deregister)],
			payload: Vec::new(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sink_and_recorder() -> (std::rc::Rc<std::cell::RefCell<Vec<SessionEvent>>>, Sink) {
		let collected = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
		let c2 = collected.clone();
		let sink: Sink = Box::new(move |ev: SessionEvent| c2.borrow_mut().push(ev));
		(collected, sink)
	}

	fn template(payload: Vec<u8>, observe: bool) -> RequestTemplate {
		RequestTemplate { method: Code::GET, options: Vec::new(), observe, payload }
	}

	#[test]
	fn con_request_acks_and_completes_on_piggybacked_response() {
		let (events, sink) = sink_and_recorder();
		let mut session = Session::start(1, Type::Con, template(Vec::new(), false), 6, sink);
		let head_id = session.front().unwrap().message_id;

		let response = CoapMessage { ty: Type::Ack, code: Code::CONTENT, message_id: head_id, token: 1, options: Vec::new(), payload: b"ok".to_vec() };
		let outcome = session.handle_inbound(response);

		assert!(outcome.immediate.is_empty());
		assert_eq!(session.lifecycle(), Lifecycle::Completed);
		assert!(events.borrow().iter().any(|e| matches!(e, SessionEvent::Finished)));
	}

	#[test]
	fn empty_ack_keeps_session_awaiting_separate_response() {
		let (_events, sink) = sink_and_recorder();
		let mut session = Session::start(1, Type::Con, template(Vec::new(), false), 6, sink);
		let head_id = session.front().unwrap().message_id;

		let ack = CoapMessage::ack(head_id);
		session.handle_inbound(ack);

		assert_eq!(session.lifecycle(), Lifecycle::Awaiting);
	}

	/// Spec §8 scenario 5: CON GET, empty ACK, then a CON 2.05 on a fresh message id carries
	/// the separate response. The session must auto-ack that CON, deliver the 2.05 to the
	/// application, and complete (no Block2 follows).
	#[test]
	fn separate_response_is_acked_delivered_and_completes() {
		let (events, sink) = sink_and_recorder();
		let mut session = Session::start(1, Type::Con, template(Vec::new(), false), 6, sink);
		let head_id = session.front().unwrap().message_id;

		let empty_ack = CoapMessage::ack(head_id);
		let outcome = session.handle_inbound(empty_ack);
		assert!(outcome.immediate.is_empty());
		assert_eq!(session.lifecycle(), Lifecycle::Awaiting);

		let separate_response = CoapMessage {
			ty: Type::Con,
			code: Code::CONTENT,
			message_id: head_id.wrapping_add(1),
			token: 1,
			options: Vec::new(),
			payload: b"later".to_vec(),
		};
		let outcome = session.handle_inbound(separate_response.clone());

		assert_eq!(outcome.immediate, vec![CoapMessage::ack(separate_response.message_id)]);
		assert_eq!(session.lifecycle(), Lifecycle::Completed);
		assert!(events.borrow().iter().any(|e| matches!(e, SessionEvent::Message(m) if *m == separate_response)));
		assert!(events.borrow().iter().any(|e| matches!(e, SessionEvent::Finished)));
	}

	#[test]
	fn duplicate_consecutive_inbound_is_coalesced() {
		let (events, sink) = sink_and_recorder();
		let mut session = Session::start(1, Type::Con, template(Vec::new(), true), 6, sink);
		let head_id = session.front().unwrap().message_id;

		let response = CoapMessage { ty: Type::Con, code: Code::CONTENT, message_id: 99, token: 1, options: vec![option::make_observe(option::Observe::Register)], payload: b"v1".to_vec() };
		session.handle_inbound(response.clone());
		session.handle_inbound(response);

		let delivered = events.borrow().iter().filter(|e| matches!(e, SessionEvent::Message(_))).count();
		assert_eq!(delivered, 1);
		let _ = head_id;
	}

	/// Spec §8 scenario 6: after several Observe notifications, cancelling emits exactly one NON
	/// GET with Observe=1 on the session's token, and the session stops accepting further work
	/// (lifecycle is terminal, queue is drained) so nothing more is ever delivered for it.
	#[test]
	fn observe_cancel_emits_single_deregister_and_stops_delivery() {
		let (events, sink) = sink_and_recorder();
		let mut session = Session::start(1, Type::Non, template(Vec::new(), true), 6, sink);

		for (id, payload) in [(10u16, b"v1".to_vec()), (11u16, b"v2".to_vec()), (12u16, b"v3".to_vec())] {
			let notify = CoapMessage {
				ty: Type::Non,
				code: Code::CONTENT,
				message_id: id,
				token: 1,
				options: vec![option::make_observe(option::Observe::Register)],
				payload,
			};
			session.handle_inbound(notify);
		}
		assert_eq!(session.lifecycle(), Lifecycle::Sending);

		let deregister = session.cancel().expect("observing session emits a deregister");
		assert_eq!(deregister.ty, Type::Non);
		assert_eq!(deregister.code, Code::GET);
		assert_eq!(deregister.token, 1);
		assert_eq!(option::observe(&deregister.options), Some(option::Observe::Deregister));

		assert_eq!(session.lifecycle(), Lifecycle::Cancelled);
		assert!(session.front().is_none());
		assert!(events.borrow().iter().any(|e| matches!(e, SessionEvent::Cancelled)));

		let notified_count = events.borrow().iter().filter(|e| matches!(e, SessionEvent::Message(_))).count();
		assert_eq!(notified_count, 3);

		// "No further inbound for that token is delivered" is the Connection's job (it removes
		// the token from its session table as soon as `cancel` is called, see `Connection::cancel`
		// in lib.rs) rather than a guard inside `Session` itself, so it isn't re-checked here.
	}

	#[test]
	fn rst_completes_session() {
		let (events, sink) = sink_and_recorder();
		let mut session = Session::start(1, Type::Con, template(Vec::new(), false), 6, sink);
		let head_id = session.front().unwrap().message_id;

		session.handle_inbound(CoapMessage::rst(head_id));

		assert_eq!(session.lifecycle(), Lifecycle::Completed);
		assert!(events.borrow().iter().any(|e| matches!(e, SessionEvent::Finished)));
	}

	/// A Block2 NUM at the top of the 20-bit field drops the continuation instead of panicking
	/// or re-requesting the same block forever.
	#[test]
	fn block2_continuation_is_dropped_when_num_overflows_instead_of_looping() {
		let (_events, sink) = sink_and_recorder();
		let mut session = Session::start(1, Type::Non, template(Vec::new(), false), 6, sink);

		let last_representable = BlockValue::new((1 << 20) - 1, true, 0).unwrap();
		let notify = CoapMessage {
			ty: Type::Non,
			code: Code::CONTENT,
			message_id: 5,
			token: 1,
			options: vec![option::make_block2(last_representable)],
			payload: b"chunk".to_vec(),
		};

		let outcome = session.handle_inbound(notify);

		assert!(outcome.immediate.is_empty());
		assert_eq!(session.lifecycle(), Lifecycle::Sending);
	}
}
