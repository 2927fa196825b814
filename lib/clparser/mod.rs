//! Parsing of MSVC's `/showIncludes` output.
//!
//! When a rule's `deps = msvc` binding is set, the compiler is expected to
//! print one line per included header to stdout, prefixed by
//! [`msvc_deps_prefix`][CLParser::new] (`Note: including file:` by
//! default). Those lines are filtered out of the command's captured output
//! and turned into a deduplicated list of header paths.

use raw_string::{RawStr, RawString};
use std::collections::HashSet;

/// Strips `/showIncludes` lines out of a command's output and collects the
/// set of header paths it names.
pub struct CLParser {
	prefix: RawString,
	includes: HashSet<RawString>,
}

impl CLParser {
	/// Create a parser looking for lines starting with `prefix`.
	pub fn new(prefix: impl Into<RawString>) -> Self {
		CLParser {
			prefix: prefix.into(),
			includes: HashSet::new(),
		}
	}

	/// Process one line of a command's captured output (without the
	/// trailing newline). Returns `Some(line)` if it should be kept in the
	/// command's output, or `None` if it was a `/showIncludes` line.
	pub fn filter_line<'a>(&mut self, line: &'a RawStr) -> Option<&'a RawStr> {
		match strip_header_prefix(line, &self.prefix) {
			Some(path) => {
				self.includes.insert(normalize(path));
				None
			}
			None => Some(line),
		}
	}

	/// Process a whole buffer of output, returning the text with
	/// `/showIncludes` lines removed.
	pub fn filter(&mut self, output: &RawStr) -> RawString {
		let mut kept = RawString::new();
		for line in split_lines(output) {
			if let Some(line) = self.filter_line(line) {
				kept.push_str(line);
				kept.push_str(RawStr::from_str("\n"));
			}
		}
		kept
	}

	/// The headers discovered so far, each path appearing once.
	pub fn includes(&self) -> impl Iterator<Item = &RawStr> {
		self.includes.iter().map(|s| &s[..])
	}
}

/// Splits on `\n`, also stripping a trailing `\r` from each line (so both
/// Unix and Windows line endings work), and a trailing empty line.
fn split_lines(s: &RawStr) -> impl Iterator<Item = &RawStr> {
	let mut rest: &RawStr = s;
	let mut done = false;
	std::iter::from_fn(move || {
		if done {
			return None;
		}
		match memchr::memchr(b'\n', rest.as_bytes()) {
			Some(i) => {
				let line = &rest[..i];
				rest = &rest[i + 1..];
				Some(strip_cr(line))
			}
			None => {
				done = true;
				if rest.is_empty() {
					None
				} else {
					Some(strip_cr(rest))
				}
			}
		}
	})
}

fn strip_cr(line: &RawStr) -> &RawStr {
	if line.last() == Some(b'\r') {
		&line[..line.len() - 1]
	} else {
		line
	}
}

/// MSVC pads the prefix and the path with a single space; extra leading
/// whitespace on the path is trimmed too.
fn strip_header_prefix<'a>(line: &'a RawStr, prefix: &RawStr) -> Option<&'a RawStr> {
	if !line.starts_with(prefix.to_str().ok()?) {
		return None;
	}
	let mut rest = &line[prefix.len()..];
	while let Some((b' ', tail)) = rest.split_first() {
		rest = tail;
	}
	Some(rest)
}

/// Headers are deduplicated case-insensitively, as Windows paths are.
fn normalize(path: &RawStr) -> RawString {
	RawString::from_bytes(path.as_bytes().to_ascii_lowercase())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn strips_show_includes_lines_and_collects_headers() {
		let mut p = CLParser::new(RawString::from("Note: including file:"));
		let out = p.filter(RawStr::from_str(
			"hello.c\nNote: including file: C:\\foo\\bar.h\nNote: including file:  C:\\foo\\Bar.h\ndone\n",
		));
		assert_eq!(out.as_bytes(), b"hello.c\ndone\n");
		let mut includes: Vec<&[u8]> = p.includes().map(|s| s.as_bytes()).collect();
		includes.sort();
		assert_eq!(includes, vec![b"c:\\foo\\bar.h".as_ref()]);
	}

	#[test]
	fn custom_prefix() {
		let mut p = CLParser::new(RawString::from("INCLUDE:"));
		let out = p.filter(RawStr::from_str("a\nINCLUDE: x.h\nb"));
		assert_eq!(out.as_bytes(), b"a\nb\n");
		assert_eq!(p.includes().count(), 1);
	}
}
