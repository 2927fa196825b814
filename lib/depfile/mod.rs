//! Parsing of Makefile-style dependency files, as written by `gcc -MD` and
//! similar compiler flags.

use raw_string::{RawStr, RawString};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Error, ErrorKind, Read};
use std::mem::replace;
use std::path::Path;

/// Read a Makefile-style dependency file.
///
/// `f` is called once per target, in the order the targets appear, with
/// its full list of dependencies. A target with no dependencies that was
/// already seen as someone else's dependency is the GCC `-MP` idiom (a
/// phony rule guarding against a removed header) and is dropped rather
/// than reported; the same target re-appearing later *with* dependencies
/// is an error.
pub fn read_deps_file(
	file_name: &Path,
	f: impl FnMut(RawString, Vec<RawString>) -> Result<(), Error>,
) -> Result<(), Error> {
	read_deps_file_from(File::open(file_name)?, f)
}

#[derive(Default)]
struct State {
	/// The (incomplete) path we're currently reading.
	path: RawString,
	/// Target names collected so far for the current rule.
	targets: Vec<RawString>,
	/// Whether we've seen the `:` that ends the target list.
	seen_colon: bool,
	/// Dependencies collected so far for the current rule.
	deps: Vec<RawString>,
}

impl State {
	fn add_part(&mut self, s: &RawStr) {
		self.path.push_str(s);
	}

	fn finish_path(&mut self) {
		if self.path.is_empty() {
			return;
		}
		let mut path = replace(&mut self.path, RawString::new());
		if !self.seen_colon {
			if path.last() == Some(b':') {
				path.pop();
				if !path.is_empty() {
					self.targets.push(path);
				}
				self.seen_colon = true;
			} else {
				self.targets.push(path);
			}
		} else {
			self.deps.push(path);
		}
	}

	fn finish_rule(
		&mut self,
		f: &mut impl FnMut(RawString, Vec<RawString>) -> Result<(), Error>,
		deps_seen: &mut HashSet<RawString>,
	) -> Result<(), Error> {
		self.finish_path();
		self.seen_colon = false;
		let targets = replace(&mut self.targets, Vec::new());
		let deps = replace(&mut self.deps, Vec::new());
		if targets.is_empty() {
			return Ok(());
		}
		for target in &targets {
			if deps.is_empty() {
				if deps_seen.contains(target) {
					continue;
				}
			} else if deps_seen.contains(target) {
				return Err(Error::new(
					ErrorKind::InvalidData,
					"Input also appears as a target with its own dependencies",
				));
			}
			f(target.clone(), deps.clone())?;
		}
		deps_seen.extend(deps);
		Ok(())
	}
}

fn read_deps_file_from(
	file: impl Read,
	mut f: impl FnMut(RawString, Vec<RawString>) -> Result<(), Error>,
) -> Result<(), Error> {
	let mut file = BufReader::new(file);

	let mut state = State::default();
	let mut deps_seen = HashSet::new();
	let mut line = RawString::new();

	loop {
		line.clear();
		if file.read_until(b'\n', &mut line.as_mut_bytes())? == 0 {
			break;
		}

		if line.last() == Some(b'\n') {
			line.pop();
		}
		if line.last() == Some(b'\r') {
			line.pop();
		}

		let mut write_offset = 0;
		let mut read_offset = 0;

		loop {
			match memchr::memchr2(b' ', b'\\', line[read_offset..].as_bytes())
				.map(|i| i + read_offset)
			{
				Some(i) if line[i] == b'\\' && i + 1 == line.len() => {
					// Backslash at the end of the line: continuation.
					state.add_part(&line[write_offset..i]);
					state.finish_path();
					break;
				}
				Some(i) if line[i] == b'\\' => {
					let c = line[i + 1];
					match c {
						b' ' | b'\\' | b'#' | b'*' | b'[' | b']' | b'|' => {
							// Escaped character: drop the backslash.
							state.add_part(&line[write_offset..i]);
							write_offset = i + 1;
						}
						_ => (), // Not a recognized escape: keep the backslash.
					}
					read_offset = i + 2;
				}
				Some(i) => {
					debug_assert_eq!(line[i], b' ');
					state.add_part(&line[write_offset..i]);
					state.finish_path();
					write_offset = i + 1;
					read_offset = i + 1;
				}
				None => {
					state.add_part(&line[write_offset..]);
					state.finish_rule(&mut f, &mut deps_seen)?;
					break;
				}
			}
		}
	}

	if !state.targets.is_empty() {
		Err(Error::new(ErrorKind::InvalidData, "Unexpected end of file"))
	} else {
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Cursor;

	fn check(input: &str, mut expected: &[(&str, &[&str])]) {
		let file = Cursor::new(input);
		read_deps_file_from(file, |target, deps| {
			assert_eq!(target, expected[0].0);
			assert!(deps.iter().eq(expected[0].1.iter()));
			expected = &expected[1..];
			Ok(())
		})
		.unwrap();
		assert!(expected.is_empty());
	}

	#[test]
	fn simple() {
		check(
			"output: input input2 input3 \\\n input4 input5 \\\n input6\n\noutput2: input7\n",
			&[
				(
					"output",
					&["input", "input2", "input3", "input4", "input5", "input6"],
				),
				("output2", &["input7"]),
			],
		);
	}

	#[test]
	fn escapes() {
		check(
			"bloep\\ bloep: a\\ b\\*c\\\\d\\ab",
			&[("bloep bloep", &["a b*c\\d\\ab"])],
		);
	}

	#[test]
	fn colons() {
		check(
			"output: in:put in:put:2:",
			&[("output", &["in:put", "in:put:2:"])],
		);
	}

	#[test]
	fn no_deps() {
		check(
			"hello:\nworld:\n\ntest:\n",
			&[("hello", &[]), ("world", &[]), ("test", &[])],
		);
	}

	#[test]
	fn multiple_targets() {
		check(
			"a.o gcov.note: a.c\n",
			&[("a.o", &["a.c"]), ("gcov.note", &["a.c"])],
		);
	}

	#[test]
	fn mp_idiom_extra_targets_are_dropped() {
		// `gcc -MMD -MP` emits a bare rule for every header so that removing
		// a header doesn't break the build by referring to a missing target;
		// such a restatement shouldn't be reported as its own rule.
		check(
			"output: input header.h\n\nheader.h:\n",
			&[("output", &["input", "header.h"])],
		);
	}

	#[test]
	fn conflicting_rule_for_a_dependency_is_an_error() {
		let file = Cursor::new("output: input header.h\n\nheader.h: something.h\n");
		assert!(read_deps_file_from(file, |_, _| Ok(())).is_err());
	}

	#[test]
	fn truncated() {
		let file = Cursor::new("output: input input2 input3 \\\n input4 input5 \\");
		assert!(read_deps_file_from(file, |_, _| Ok(())).is_err());
	}
}
