/// Application-visible failure kinds (spec §7). Internal fallible steps use
/// [`utils::error::Result`] (logged-and-discarded); this enum is only surfaced at the
/// Connection/Session boundary, where the application needs to distinguish outcomes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Fail {
	/// A constructed message has an invalid code class/detail for its role (e.g. a non-request
	/// code class passed to `request_raw`).
	CodeError,
	/// The underlying transport failed to send or read.
	TransportError,
	/// No inbound traffic was seen within `ping_every * K`.
	TimedOut,
}
