use utils::error::*;

use crate::option::{self, Opt};

/// The request-URI components accepted by [`crate::Connection::request`] (spec §6).
#[derive(Clone, Debug, Default)]
pub struct Uri {
	pub host: Option<String>,
	pub port: Option<u16>,
	pub paths: Vec<String>,
	pub queries: Vec<String>,
}

impl Uri {
	/// Builds the Uri-Host/Port/Path/Query option sequence, validating each segment per §4.2.
	pub fn to_options(&self) -> Result<Vec<Opt>> {
		let mut opts = Vec::new();

		if let Some(host) = &self.host {
			opts.push(option::make_uri_host(host)?);
		}

		if let Some(port) = self.port {
			opts.push(option::make_uri_port(port));
		}

		for segment in &self.paths {
			opts.push(option::make_uri_path(segment)?);
		}

		for segment in &self.queries {
			opts.push(option::make_uri_query(segment)?);
		}

		Ok(opts)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builds_options_in_order() {
		let uri = Uri {
			host: Some("example.com".into()),
			port: Some(5683),
			paths: vec!["a".into(), "b".into()],
			queries: vec!["x=1".into()],
		};

		let opts = uri.to_options().unwrap();
		let numbers: Vec<u16> = opts.iter().map(|o| o.number).collect();
		assert_eq!(numbers, vec![option::URI_HOST, option::URI_PORT, option::URI_PATH, option::URI_PATH, option::URI_QUERY]);
	}

	#[test]
	fn rejects_invalid_path_segment() {
		let uri = Uri { paths: vec![".".into()], ..Default::default() };
		assert!(uri.to_options().is_err());
	}
}
