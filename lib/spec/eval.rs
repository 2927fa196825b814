//! Variable scoping and `$`-expansion.
//!
//! Top-level variables are expanded eagerly as they're read (so later
//! definitions can refer to earlier ones); `rule` bodies are kept
//! unexpanded until they're bound to a particular `build` edge, since they
//! refer to `$in`/`$out`, which aren't known until then.

use super::eat::{eat_identifier, is_identifier_char};
use super::error::{ExpansionError, InvalidEscape};
use raw_string::{RawStr, RawString};

/// A variable with a name and an already-expanded definition.
#[derive(Debug)]
pub struct ExpandedVar<'a> {
	pub name: &'a str,
	pub value: RawString,
}

/// A variable with a name and an unexpanded (`rule`-body) definition.
#[derive(Debug, Clone, Copy)]
pub struct UnexpandedVar<'a> {
	pub name: &'a str,
	pub value: &'a RawStr,
}

/// A rule definition: a name and its unexpanded bindings.
#[derive(Debug)]
pub struct Rule<'a> {
	pub name: &'a str,
	pub vars: Vec<UnexpandedVar<'a>>,
}

/// A file-level scope: variables and rules visible while reading one
/// manifest, plus (through `parent_scope`) everything visible to the file
/// that `subninja`'d it.
#[derive(Debug)]
pub struct FileScope<'a: 'p, 'p> {
	pub parent_scope: Option<&'p FileScope<'a, 'p>>,
	pub vars: Vec<ExpandedVar<'a>>,
	pub rules: Vec<Rule<'a>>,
}

/// Scope including the current `build` statement's own variables.
#[derive(Debug)]
pub struct BuildScope<'a> {
	pub file_scope: &'a FileScope<'a, 'a>,
	pub build_vars: &'a [ExpandedVar<'a>],
}

/// Scope including `$in`, `$out`, `$in_newline`, and the bound rule's
/// variables, on top of a [`BuildScope`].
#[derive(Debug)]
pub struct BuildRuleScope<'a> {
	pub build_scope: &'a BuildScope<'a>,
	pub rule_vars: &'a [UnexpandedVar<'a>],
	pub inputs: &'a [RawString],
	pub outputs: &'a [RawString],
}

/// What [`VarScope::lookup_var`] found for a given name.
pub enum FoundVar<'a> {
	Expanded(&'a RawStr),
	Unexpanded(&'a RawStr),
	Paths { paths: &'a [RawString], newlines: bool },
}

pub trait VarScope {
	fn lookup_var(&self, var_name: &str) -> Option<FoundVar>;
}

impl<'a> VarScope for [UnexpandedVar<'a>] {
	fn lookup_var(&self, var_name: &str) -> Option<FoundVar> {
		self.iter()
			.rfind(|v| v.name == var_name)
			.map(|v| FoundVar::Unexpanded(v.value))
	}
}

impl<'a> VarScope for [ExpandedVar<'a>] {
	fn lookup_var(&self, var_name: &str) -> Option<FoundVar> {
		self.iter()
			.rfind(|v| v.name == var_name)
			.map(|v| FoundVar::Expanded(&v.value))
	}
}

impl<'a, 'p> VarScope for FileScope<'a, 'p> {
	fn lookup_var(&self, var_name: &str) -> Option<FoundVar> {
		self.vars
			.lookup_var(var_name)
			.or_else(|| self.parent_scope.and_then(|p| p.lookup_var(var_name)))
	}
}

impl<'a> VarScope for BuildScope<'a> {
	fn lookup_var(&self, var_name: &str) -> Option<FoundVar> {
		self.build_vars
			.lookup_var(var_name)
			.or_else(|| self.file_scope.lookup_var(var_name))
	}
}

impl<'a> VarScope for BuildRuleScope<'a> {
	fn lookup_var(&self, var_name: &str) -> Option<FoundVar> {
		match var_name {
			"in" => Some(FoundVar::Paths { paths: self.inputs, newlines: false }),
			"out" => Some(FoundVar::Paths { paths: self.outputs, newlines: false }),
			"in_newline" => Some(FoundVar::Paths { paths: self.inputs, newlines: true }),
			_ => self
				.build_scope
				.build_vars
				.lookup_var(var_name)
				.or_else(|| {
					self.rule_vars
						.lookup_var(var_name)
						.or_else(|| self.build_scope.file_scope.lookup_var(var_name))
				}),
		}
	}
}

impl<'a, 'p> FileScope<'a, 'p> {
	pub fn new() -> Self {
		FileScope {
			parent_scope: None,
			vars: Vec::new(),
			rules: Vec::new(),
		}
	}

	pub fn new_subscope(&'p self) -> FileScope<'a, 'p> {
		FileScope {
			parent_scope: Some(self),
			vars: Vec::new(),
			rules: Vec::new(),
		}
	}

	pub fn lookup_rule(&self, rule_name: &str) -> Option<&Rule<'a>> {
		self.rules
			.iter()
			.rfind(|r| r.name == rule_name)
			.or_else(|| self.parent_scope.and_then(|p| p.lookup_rule(rule_name)))
	}
}

/// Check that `src` contains only valid `$`-escape sequences.
pub fn check_escapes(src: &RawStr) -> Result<(), InvalidEscape> {
	let mut i = 0;
	while let Some(n) = memchr::memchr(b'$', &src.as_bytes()[i..]) {
		i += n + 1;
		match src.get(i) {
			Some(b'\n') | Some(b' ') | Some(b':') | Some(b'$') => i += 1,
			Some(x) if is_identifier_char(*x) => i += 1,
			Some(b'{') => {
				loop {
					match src.get(i + 1) {
						Some(x) if is_identifier_char(*x) => i += 1,
						Some(b'}') => break,
						_ => return Err(InvalidEscape),
					}
				}
				i += 1;
			}
			_ => return Err(InvalidEscape),
		}
	}
	Ok(())
}

pub fn expand_var<S: VarScope>(var_name: &str, scope: &S) -> Result<RawString, ExpansionError> {
	let mut s = RawString::new();
	expand_var_to(var_name, scope, &mut s, None)?;
	Ok(s)
}

pub fn expand_str<T: AsRef<RawStr>, S: VarScope>(
	source: T,
	scope: &S,
) -> Result<RawString, ExpansionError> {
	let mut s = RawString::new();
	expand_str_to(source.as_ref(), scope, &mut s, None)?;
	Ok(s)
}

pub fn expand_strs<S: VarScope>(
	sources: &[&RawStr],
	scope: &S,
) -> Result<Vec<RawString>, ExpansionError> {
	let mut vec = Vec::new();
	expand_strs_into(sources, scope, &mut vec)?;
	Ok(vec)
}

pub fn expand_strs_into<S: VarScope>(
	sources: &[&RawStr],
	scope: &S,
	vec: &mut Vec<RawString>,
) -> Result<(), ExpansionError> {
	vec.reserve(sources.len());
	for source in sources {
		vec.push(expand_str(source, scope)?);
	}
	Ok(())
}

fn is_shell_safe(c: u8) -> bool {
	matches!(c, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' | b'+' | b'/' | b'.')
}

/// POSIX-shell-escape `source` into `output`. Windows command lines are
/// built differently (see [`crate::runner`]) and don't go through here.
pub fn write_shell_escaped_to(source: &RawStr, output: &mut RawString) {
	let mut i = 0;
	loop {
		let next_quote = memchr::memchr(b'\'', &source.as_bytes()[i..]);
		let part = &source[i..i + next_quote.unwrap_or(source.len() - i)];
		if part.bytes().all(is_shell_safe) {
			output.push_str(part);
		} else {
			output.push(b'\'');
			output.push_str(part);
			output.push(b'\'');
		}
		if let Some(next_quote) = next_quote {
			output.push_str("\\'");
			i += next_quote + 1;
		} else {
			break;
		}
	}
}

fn expand_var_to<S: VarScope>(
	var_name: &str,
	scope: &S,
	result: &mut RawString,
	prot: Option<&RecursionProtection>,
) -> Result<(), ExpansionError> {
	Ok(match scope.lookup_var(var_name) {
		Some(FoundVar::Expanded(e)) => result.push_str(e),
		Some(FoundVar::Paths { paths, newlines }) => {
			for (i, p) in paths.iter().enumerate() {
				if !newlines && i > 0 {
					result.push(b' ');
				}
				write_shell_escaped_to(p, result);
				if newlines {
					result.push(b'\n');
				}
			}
		}
		Some(FoundVar::Unexpanded(e)) => {
			check_recursion(var_name, prot)?;
			expand_str_to(
				e,
				scope,
				result,
				Some(&RecursionProtection { parent: prot, var_name }),
			)?;
		}
		None => {}
	})
}

fn expand_str_to<S: VarScope>(
	mut source: &RawStr,
	scope: &S,
	result: &mut RawString,
	prot: Option<&RecursionProtection>,
) -> Result<(), ExpansionError> {
	while let Some(i) = memchr::memchr(b'$', source.as_bytes()) {
		result.push_str(&source[..i]);
		source = &source[i + 1..];
		if let Some(var) = eat_identifier(&mut source) {
			expand_var_to(var, scope, result, prot)?;
		} else if source.starts_with("{") {
			let mut s = &source[1..];
			if let Some(var) = eat_identifier(&mut s) {
				if s.starts_with("}") {
					expand_var_to(var, scope, result, prot)?;
					source = &s[1..];
				}
			}
		} else if source.starts_with("\n") {
			source = &source[1..];
			let n = source
				.bytes()
				.position(|b| b != b' ' && b != b'\t')
				.unwrap_or(source.len());
			source = &source[n..];
		} else if source.starts_with("$") {
			source = &source[1..];
			result.push(b'$');
		}
	}
	result.push_str(source);
	Ok(())
}

struct RecursionProtection<'a> {
	parent: Option<&'a RecursionProtection<'a>>,
	var_name: &'a str,
}

fn check_recursion(
	var_name: &str,
	mut prot: Option<&RecursionProtection>,
) -> Result<(), ExpansionError> {
	let start = prot;
	while let Some(p) = prot {
		if p.var_name == var_name {
			let mut cycle = Vec::new();
			prot = start;
			while let Some(p) = prot {
				cycle.push(p.var_name.to_string());
				if p.var_name == var_name {
					return Err(ExpansionError {
						cycle: cycle.into_boxed_slice(),
					});
				}
				prot = p.parent;
			}
			unreachable!();
		}
		prot = p.parent;
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	struct Scope;
	impl VarScope for Scope {
		fn lookup_var(&self, var_name: &str) -> Option<FoundVar> {
			match var_name {
				"world" => Some(FoundVar::Expanded(RawStr::from_str("TEST"))),
				"WORLD" => Some(FoundVar::Expanded(RawStr::from_str("$TEST"))),
				"foo" => Some(FoundVar::Unexpanded(RawStr::from_str("blah"))),
				"bar" => Some(FoundVar::Unexpanded(RawStr::from_str("a $foo b $world $$c"))),
				"r" => Some(FoundVar::Unexpanded(RawStr::from_str("1 2 3 $r 4 5"))),
				"r1" => Some(FoundVar::Unexpanded(RawStr::from_str("$r2"))),
				"r2" => Some(FoundVar::Unexpanded(RawStr::from_str("$r3"))),
				"r3" => Some(FoundVar::Unexpanded(RawStr::from_str("$r1"))),
				_ => None,
			}
		}
	}

	#[test]
	fn basic_expansion() {
		assert_eq!(expand_str("hello $world", &Scope).unwrap(), "hello TEST");
		assert_eq!(expand_str("hello $WORLD", &Scope).unwrap(), "hello $TEST");
		assert_eq!(expand_str("hello $nope", &Scope).unwrap(), "hello ");
		assert_eq!(
			expand_str("hello ${world} $world$$", &Scope).unwrap(),
			"hello TEST TEST$"
		);
		assert_eq!(expand_str("foo$\n  bar", &Scope).unwrap(), "foobar");
		assert_eq!(expand_str("$foo$bar", &Scope).unwrap(), "blaha blah b TEST $c");
	}

	#[test]
	fn cycles_are_detected() {
		assert!(expand_str("$r", &Scope).unwrap_err().cycle.iter().eq(&["r"]));
		assert!(expand_str("$r2", &Scope)
			.unwrap_err()
			.cycle
			.iter()
			.eq(&["r1", "r3", "r2"]));
	}

	#[test]
	fn paths_are_shell_escaped() {
		struct PathScope;
		impl VarScope for PathScope {
			fn lookup_var(&self, var_name: &str) -> Option<FoundVar> {
				match var_name {
					"in" => Some(FoundVar::Paths {
						paths: Box::leak(Box::new([
							RawString::from("hello"),
							RawString::from("wor ld"),
						])),
						newlines: false,
					}),
					_ => None,
				}
			}
		}
		assert_eq!(expand_str("$in", &PathScope).unwrap(), "hello 'wor ld'");
	}
}
