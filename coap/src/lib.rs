#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

pub mod codec;
pub mod error;
pub mod message;
pub mod option;
pub mod queue;
pub mod reassembly;
pub mod session;
pub mod uri;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use log::{error, warn};
use rand::Rng;
use runtime::Io;
use stakker::{fwd_to, FixedTimerKey, Fwd, CX};
use utils::error::*;

pub use error::Fail;
pub use message::{Code, CoapMessage, Method, Type};
pub use option::{BlockValue, Observe};
pub use queue::RequestTemplate;
pub use session::{Lifecycle, SessionEvent};
pub use uri::Uri;

use option::{make_accept, make_content_format, make_if_match, make_if_none_match};
use queue::fresh_message_id;
use session::Session;

/// RFC 7252 §4.8.1 default retransmission timing.
const ACK_TIMEOUT: Duration = Duration::from_secs(2);
const ACK_RANDOM_FACTOR: f64 = 1.5;
const MAX_RETRANSMIT: u32 = 4;

/// Widest Block1 size (1024 bytes, SZX=6) offered until a server advertises a preference.
const DEFAULT_BLOCK1_SZX: u8 = 6;
const DEFAULT_KEEPALIVE_FACTOR: u32 = 3;

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// DTLS-PSK parameters (spec §6). Plumbed through to an external DTLS-capable transport
/// unchanged; the core never interprets them — `Connection::init` here always speaks plain UDP,
/// so a DTLS-terminating transport adapter is the thing that would consume this.
#[derive(Clone, Debug, Default)]
pub struct Security {
	pub psk: Vec<u8>,
	pub psk_hint: Option<String>,
	pub cipher_suite: Option<String>,
}

/// Connection-level configuration (spec §6).
#[derive(Clone, Debug)]
pub struct Settings {
	/// `Duration::ZERO` disables the keepalive ping.
	pub ping_every: Duration,
	/// K in `now - last_inbound_ts > ping_every * K`.
	pub keepalive_factor: u32,
	/// Present only to be forwarded to a DTLS-capable transport; unused by the plain-UDP path.
	pub security: Option<Security>,
}

impl Default for Settings {
	fn default() -> Self {
		Self { ping_every: Duration::ZERO, keepalive_factor: DEFAULT_KEEPALIVE_FACTOR, security: None }
	}
}

impl Settings {
	pub fn with_keepalive(ping_every: Duration) -> Self {
		Self { ping_every, keepalive_factor: DEFAULT_KEEPALIVE_FACTOR, security: None }
	}
}

/// Adapts a caller-supplied `Fwd<SessionEvent>` into the plain boxed closure a [`Session`]
/// expects, so `Session` itself never depends on a running `Stakker` core.
fn boxed_sink(fwd: Fwd<SessionEvent>) -> session::Sink {
	Box::new(move |ev| fwd.fwd(ev))
}

fn bind_connected(addr: SocketAddr) -> std::io::Result<UdpSocket> {
	let unspecified = match addr {
		SocketAddr::V4(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into(),
		SocketAddr::V6(_) => SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0).into(),
	};

	let socket = UdpSocket::bind(unspecified)?;
	socket.set_nonblocking(true)?;
	socket.connect(addr)?;
	Ok(socket)
}

/// RFC 7252 exponential backoff state for one session's confirmable front message.
struct Retransmit {
	due: Instant,
	attempt: u32,
}

impl Retransmit {
	fn fresh(now: Instant) -> Self {
		Self { due: now + Self::jittered(ACK_TIMEOUT), attempt: 0 }
	}

	fn jittered(base: Duration) -> Duration {
		let factor = 1.0 + rand::thread_rng().gen::<f64>() * (ACK_RANDOM_FACTOR - 1.0);
		base.mul_f64(factor)
	}

	/// Advances to the next backoff step, returning `false` once `MAX_RETRANSMIT` is exceeded.
	fn backoff(&mut self, now: Instant) -> bool {
		if self.attempt >= MAX_RETRANSMIT {
			return false;
		}

		self.attempt += 1;
		self.due = now + Self::jittered(ACK_TIMEOUT * (1 << self.attempt));
		true
	}
}

/// Owns the UDP transport for one logical CoAP connection and every request session running
/// over it (spec §4.5). A single `stakker` actor; sessions are plain structs in a token-keyed
/// map rather than actors of their own, since only this actor's event loop ever touches them.
pub struct Connection {
	io: Io<UdpSocket>,
	sessions: HashMap<u64, (Session, Retransmit)>,
	block1_szx: u8,
	last_inbound_ts: Instant,
	settings: Settings,
	tick: FixedTimerKey,
	keepalive: FixedTimerKey,
}

impl Connection {
	pub fn init(cx: CX![], addr: SocketAddr, settings: Settings) -> Option<Self> {
		let socket = bind_connected(addr).ok_or(|err| error!("Failed to create socket: {err}"))?;

		let read_fwd = fwd_to!([cx], read() as (Box<[u8]>));
		let io = Io::new(socket, read_fwd);

		let mut this = Self {
			io,
			sessions: HashMap::new(),
			block1_szx: DEFAULT_BLOCK1_SZX,
			last_inbound_ts: cx.now(),
			settings,
			tick: FixedTimerKey::default(),
			keepalive: FixedTimerKey::default(),
		};

		this.reset_tick(cx);
		if !this.settings.ping_every.is_zero() {
			this.reset_keepalive(cx);
		}

		Some(this)
	}

	fn reset_tick(&mut self, cx: CX![]) {
		let actor = cx.access_actor().clone();
		self.tick = cx.after(TICK_PERIOD, move |s| actor.apply(s, move |this, cx| this.tick(cx)));
	}

	fn reset_keepalive(&mut self, cx: CX![]) {
		let actor = cx.access_actor().clone();
		let period = self.settings.ping_every;
		self.keepalive = cx.after(period, move |s| actor.apply(s, move |this, cx| this.keepalive_tick(cx)));
	}

	/// The 1Hz retransmission sweep (spec §4.4 periodic tick), reimplemented with RFC 7252
	/// exponential backoff rather than an unconditional per-second resend (see DESIGN.md).
	fn tick(&mut self, cx: CX![]) {
		let now = cx.now();
		let mut outgoing = Vec::new();
		let mut exhausted = Vec::new();

		for (&token, (session, retransmit)) in self.sessions.iter_mut() {
			let Some(front) = session.front() else { continue };
			let front = front.clone();

			if front.ty == Type::Non {
				session.dequeue(front.message_id);
				outgoing.push(front);
				continue;
			}

			if retransmit.due > now {
				continue;
			}

			if retransmit.backoff(now) {
				outgoing.push(front);
			} else {
				warn!("giving up on token {token:#x} after {MAX_RETRANSMIT} retransmissions");
				session.fail(Fail::TransportError);
				exhausted.push(token);
			}
		}

		for msg in outgoing {
			self.send_now(cx, msg);
		}

		for token in exhausted {
			self.sessions.remove(&token);
		}

		self.reset_tick(cx);
	}

	fn keepalive_tick(&mut self, cx: CX![]) {
		let now = cx.now();

		if now.duration_since(self.last_inbound_ts) > self.settings.ping_every * self.settings.keepalive_factor {
			warn!("no inbound traffic within ping_every * {}; connection timed out", self.settings.keepalive_factor);
			self.fail_all(cx, Fail::TimedOut);
			return;
		}

		self.send_now(cx, CoapMessage::empty(Type::Con, fresh_message_id()));
		self.reset_keepalive(cx);
	}

	fn fail_all(&mut self, cx: CX![], kind: Fail) {
		for (_, (session, _)) in self.sessions.iter_mut() {
			session.fail(kind);
		}
		self.sessions.clear();

		cx.timer_del(self.tick);
		cx.timer_del(self.keepalive);
	}

	fn send_now(&mut self, cx: CX![], msg: CoapMessage) {
		let bytes = codec::encode(&msg);

		if self.io.write(|buf| buf.extend_from_slice(&bytes)).is_err() {
			error!("transport write failed; failing connection");
			self.fail_all(cx, Fail::TransportError);
		}
	}

	fn read(&mut self, cx: CX![], buf: Box<[u8]>) {
		self.last_inbound_ts = cx.now();

		let Ok(msg) = codec::decode(&buf) else { return };

		if msg.code.is_empty() && msg.token == 0 {
			let Some(&token) = self.sessions.iter().find(|(_, (s, _))| s.contains(msg.message_id)).map(|(t, _)| t).as_ref() else {
				warn!("received empty message with unmatched message id {}", msg.message_id);
				return;
			};

			self.dispatch(cx, token, msg);
			return;
		}

		if !self.sessions.contains_key(&msg.token) {
			warn!("received message for unknown token {:#x}, sending RST", msg.token);
			self.send_now(cx, CoapMessage::rst(msg.message_id));
			return;
		}

		self.dispatch(cx, msg.token, msg);
	}

	fn dispatch(&mut self, cx: CX![], token: u64, msg: CoapMessage) {
		let Some((session, retransmit)) = self.sessions.get_mut(&token) else { return };
		let outcome = session.handle_inbound(msg);

		if let Some(szx) = outcome.new_block1_szx {
			self.block1_szx = szx;
		}

		*retransmit = Retransmit::fresh(cx.now());

		let finished = matches!(session.lifecycle(), Lifecycle::Completed | Lifecycle::Failed | Lifecycle::Cancelled);

		for msg in outcome.immediate {
			self.send_now(cx, msg);
		}

		if finished {
			self.sessions.remove(&token);
		}
	}

	fn fresh_token(&self) -> u64 {
		loop {
			let token = rand::random::<u64>();
			if token != 0 && !self.sessions.contains_key(&token) {
				return token;
			}
		}
	}

	/// Starts a new request session and transmits its head message. See spec §6.
	#[allow(clippy::too_many_arguments)]
	pub fn request(
		&mut self,
		cx: CX![],
		method: Method,
		ty: Type,
		observe: bool,
		uri: Uri,
		if_match: Vec<Vec<u8>>,
		if_none_match: bool,
		content_format: Option<u16>,
		accept: Option<u16>,
		payload: Vec<u8>,
		sink: Fwd<SessionEvent>,
	) -> Result<u64> {
		let mut options = uri.to_options()?;

		for etag in if_match {
			options.push(make_if_match(&etag));
		}
		if if_none_match {
			options.push(make_if_none_match());
		}
		if let Some(cf) = content_format {
			options.push(make_content_format(cf));
		}
		if let Some(ac) = accept {
			options.push(make_accept(ac));
		}

		let token = self.fresh_token();
		let template = RequestTemplate { method: method.code(), options, observe, payload };
		let session = Session::start(token, ty, template, self.block1_szx, boxed_sink(sink));

		self.sessions.insert(token, (session, Retransmit::fresh(cx.now())));

		if let Some(head) = self.sessions[&token].0.front().cloned() {
			self.send_now(cx, head);
		}

		Ok(token)
	}

	/// Starts a session from a caller-assembled list of raw messages. See spec §6.
	pub fn request_raw(&mut self, cx: CX![], ty: Type, messages: Vec<CoapMessage>, sink: Fwd<SessionEvent>) -> Result<u64> {
		let Some(token) = messages.first().map(|m| m.token) else {
			warn!("request_raw called with no messages");
			return Err(());
		};

		if self.sessions.contains_key(&token) {
			warn!("token {token:#x} is already in use by another session");
			return Err(());
		}

		if let Some(bad) = messages.iter().find(|m| !m.code.has_valid_class()) {
			warn!("request_raw message has reserved code class {}.{:02}", bad.code.class, bad.code.detail);
			sink.fwd(SessionEvent::Failed(Fail::CodeError));
			return Err(());
		}

		let session = Session::start_raw(token, ty, messages, boxed_sink(sink));
		self.sessions.insert(token, (session, Retransmit::fresh(cx.now())));

		if let Some(head) = self.sessions[&token].0.front().cloned() {
			self.send_now(cx, head);
		}

		Ok(token)
	}

	/// Cancels a session: deregisters an active observation, then drops its state.
	pub fn cancel(&mut self, cx: CX![], token: u64) {
		let Some((mut session, _)) = self.sessions.remove(&token) else { return };

		if let Some(deregister) = session.cancel() {
			self.send_now(cx, deregister);
		}
	}
}
