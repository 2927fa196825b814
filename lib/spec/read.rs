//! Reading a `build.ninja` file (and everything it `include`s or
//! `subninja`s) into a [`crate::graph::State`].

use super::error::ReadError;
use super::eval::{
	expand_str, expand_strs, expand_strs_into, expand_var, BuildRuleScope, BuildScope, ExpandedVar,
	FileScope, Rule, UnexpandedVar, VarScope,
};
use super::parse::{Parser, Statement, Variable};
use crate::error::{AddLocationToError, AddLocationToResult, ErrorWithLocation, Location};
use crate::graph::{DepsKind, Edge, Mark, State};
use crate::path;
use pile::Pile;
use raw_string::{RawStr, RawString};
use std::mem::replace;
use std::path::Path;
use std::str::from_utf8;

fn read_bytes(file_name: &Path) -> Result<Vec<u8>, ReadError> {
	use std::fs::File;
	use std::io::{BufReader, Read};
	let mut bytes = Vec::new();
	File::open(file_name)
		.and_then(|f| BufReader::with_capacity(0x10000, f).read_to_end(&mut bytes))
		.map_err(|error| ReadError::IoError {
			file_name: file_name.to_owned(),
			error,
		})?;
	Ok(bytes)
}

/// Read, parse, and resolve a `build.ninja` file (plus anything it
/// transitively `include`s or `subninja`s) into a build graph.
pub fn read(file_name: &Path) -> Result<State, ErrorWithLocation<ReadError>> {
	let source = read_bytes(file_name).err_at(Location::UNKNOWN)?;
	read_from(file_name, &source)
}

/// [`read()`], but with the source given directly instead of read from a
/// file. Useful for testing.
pub fn read_from(file_name: &Path, source: &[u8]) -> Result<State, ErrorWithLocation<ReadError>> {
	let pile = Pile::new();
	let mut state = State::new();
	let mut scope = FileScope::new();
	read_into(file_name, RawStr::from_bytes(source), &pile, &mut state, &mut scope)?;

	if let Some(var) = scope
		.vars
		.iter_mut()
		.rfind(|var| var.name.as_bytes() == b"builddir")
	{
		state.build_dir = Some(replace(&mut var.value, RawString::new()));
	}

	Ok(state)
}

/// Parses `N[.M[.P]][-suffix]`, the format ninja uses for both
/// `ninja_required_version` and `ninja_dyndep_version`.
fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
	let text = text.split('-').next().unwrap_or(text);
	let mut parts = text.split('.');
	let major = parts.next()?.parse().ok()?;
	let minor = match parts.next() {
		Some(p) => p.parse().ok()?,
		None => 0,
	};
	let patch = match parts.next() {
		Some(p) => p.parse().ok()?,
		None => 0,
	};
	Some((major, minor, patch))
}

/// `ninja_required_version` is interpreted immediately, not deferred like an
/// ordinary binding: a manifest asking for a newer tool than this one fails
/// the parse right away instead of being silently accepted.
fn check_required_version(
	value: &RawString,
	loc: Location,
) -> Result<(), ErrorWithLocation<ReadError>> {
	let text = value
		.to_str()
		.map_err(|_| ReadError::InvalidUtf8 {
			var: Some("ninja_required_version".to_owned()),
		})
		.err_at(loc)?;
	let required = parse_version(text)
		.ok_or_else(|| ReadError::InvalidVersion(text.to_owned()).at(loc))?;
	let supported = parse_version(env!("CARGO_PKG_VERSION")).expect("CARGO_PKG_VERSION is valid");
	if required > supported {
		return Err(ReadError::UnsupportedVersion {
			required: text.to_owned(),
			supported,
		}
		.at(loc));
	}
	Ok(())
}

fn canon_path(
	raw: RawString,
	loc: Location,
) -> Result<(RawString, u64), ErrorWithLocation<ReadError>> {
	let text = raw
		.to_str()
		.map_err(|_| ReadError::InvalidUtf8 { var: None })
		.err_at(loc)?;
	let (canon, bits) = path::canonicalize(text)
		.map_err(|_| ReadError::EmptyPath)
		.err_at(loc)?;
	Ok((RawString::from(canon), bits))
}

fn read_into<'a: 'p, 'p>(
	file_name: &Path,
	source: &'a RawStr,
	pile: &'a Pile<Vec<u8>>,
	state: &mut State,
	scope: &mut FileScope<'a, 'p>,
) -> Result<(), ErrorWithLocation<ReadError>> {
	let mut parser = Parser::new(file_name, source);

	while let Some(statement) = parser.next_statement()? {
		let loc = parser.location();
		match statement {
			Statement::Variable { name, value } => {
				let value = expand_str(value, scope).err_at(loc)?;
				if name == "ninja_required_version" {
					check_required_version(&value, loc)?;
				}
				scope.vars.push(ExpandedVar { name, value });
			}
			Statement::Rule { name } => {
				if scope.rules.iter().any(|rule| rule.name == name) {
					return Err(ReadError::DuplicateRule(name.to_string()).at(loc));
				}
				let mut vars = Vec::new();
				while let Some(var) = parser.next_variable()? {
					if !matches!(
						var.name,
						"command"
							| "description" | "depfile"
							| "deps" | "msvc_deps_prefix"
							| "rspfile" | "rspfile_content"
							| "generator" | "restat"
							| "pool" | "dyndep"
					) {
						return Err(
							ReadError::UnknownVariable(var.name.to_string()).at(parser.location())
						);
					}
					vars.push(UnexpandedVar {
						name: var.name,
						value: var.value,
					});
				}
				scope.rules.push(Rule { name, vars });
				state.rules.push(crate::graph::Rule {
					name: name.to_owned(),
				});
			}
			Statement::Pool { name } => {
				if state.lookup_pool(name).is_some() {
					return Err(ReadError::DuplicatePool(name.to_string()).at(loc));
				}
				let mut depth = None;
				while let Some(Variable { name, value }) = parser.next_variable()? {
					let loc = parser.location();
					if name != "depth" {
						return Err(ReadError::UnknownVariable(name.to_string()).at(loc));
					}
					let value = expand_str(value, scope).err_at(loc)?;
					depth = Some(
						from_utf8(value.as_bytes())
							.ok()
							.and_then(|s| s.parse::<u32>().ok())
							.ok_or_else(|| ReadError::InvalidPoolDepth.at(loc))?,
					);
				}
				match depth {
					Some(0) => return Err(ReadError::ZeroPoolDepth(name.to_string()).at(loc)),
					Some(depth) => state
						.pools
						.push(crate::graph::Pool::new(name.to_owned(), depth)),
					None => return Err(ReadError::ExpectedPoolDepth.at(parser.location())),
				}
			}
			Statement::Build {
				rule_name,
				explicit_outputs,
				implicit_outputs,
				explicit_deps,
				implicit_deps,
				order_deps,
				validations,
			} => {
				let mut vars = Vec::new();
				while let Some(Variable { name, value }) = parser.next_variable()? {
					vars.push(ExpandedVar {
						name,
						value: expand_str(value, scope).err_at(parser.location())?,
					});
				}

				let build_scope = BuildScope {
					file_scope: scope,
					build_vars: &vars,
				};

				let implicit_output_count = implicit_outputs.len();
				let mut implicit_dep_count = implicit_deps.len();
				let mut order_dep_count = order_deps.len();

				let mut outputs =
					Vec::with_capacity(explicit_outputs.len() + implicit_outputs.len());
				let mut inputs = Vec::with_capacity(explicit_deps.len() + implicit_deps.len());
				expand_strs_into(&explicit_outputs, &build_scope, &mut outputs).err_at(loc)?;
				expand_strs_into(&explicit_deps, &build_scope, &mut inputs).err_at(loc)?;

				let is_phony = rule_name == "phony";

				let mut command = RawString::new();
				let mut description = RawString::new();
				let mut depfile = RawString::new();
				let mut deps = DepsKind::None;
				let mut msvc_deps_prefix = RawString::from("Note: including file: ");
				let mut generator = false;
				let mut restat = false;
				let mut rspfile = RawString::new();
				let mut rspfile_content = RawString::new();
				let mut pool_name = String::new();
				let mut dyndep_path: Option<RawString> = None;

				if !is_phony {
					let rule = scope
						.lookup_rule(rule_name)
						.ok_or_else(|| ReadError::UndefinedRule(rule_name.to_string()).at(loc))?;

					let build_rule_scope = BuildRuleScope {
						build_scope: &build_scope,
						rule_vars: &rule.vars,
						inputs: &inputs,
						outputs: &outputs,
					};

					let expand = |name| expand_var(name, &build_rule_scope).err_at(loc);

					let pool = expand("pool")?;
					if !pool.is_empty() {
						let name = pool
							.to_str()
							.map_err(|_| ReadError::InvalidUtf8 {
								var: Some("pool".to_owned()),
							})
							.err_at(loc)?;
						if state.lookup_pool(name).is_none() {
							return Err(ReadError::UndefinedPoolBinding(pool.clone()).at(loc));
						}
						pool_name = name.to_owned();
					}

					command = expand("command")?;
					description = expand("description")?;
					depfile = expand("depfile")?;
					deps = match expand("deps")?.as_bytes() {
						b"gcc" => DepsKind::Gcc,
						b"msvc" => DepsKind::Msvc,
						_ => DepsKind::None,
					};
					let prefix = expand("msvc_deps_prefix")?;
					if !prefix.is_empty() {
						msvc_deps_prefix = prefix;
					}
					generator = build_rule_scope.lookup_var("generator").is_some();
					restat = build_rule_scope.lookup_var("restat").is_some();
					rspfile = expand("rspfile")?;
					rspfile_content = expand("rspfile_content")?;
					let dd = expand("dyndep")?;
					if !dd.is_empty() {
						dyndep_path = Some(dd);
					}
				}

				expand_strs_into(&implicit_outputs, &build_scope, &mut outputs).err_at(loc)?;
				expand_strs_into(&implicit_deps, &build_scope, &mut inputs).err_at(loc)?;
				let order_deps = expand_strs(&order_deps, &build_scope).err_at(loc)?;
				for d in order_deps {
					inputs.push(d);
				}
				let validations = expand_strs(&validations, &build_scope).err_at(loc)?;

				let mut output_ids = Vec::with_capacity(outputs.len());
				for out in outputs {
					let (canon, bits) = canon_path(out, loc)?;
					output_ids.push(state.get_node(canon, bits));
				}
				let mut input_ids = Vec::with_capacity(inputs.len());
				for input in inputs {
					let (canon, bits) = canon_path(input, loc)?;
					input_ids.push(state.get_node(canon, bits));
				}
				let mut validation_ids = Vec::with_capacity(validations.len());
				for v in validations {
					let (canon, bits) = canon_path(v, loc)?;
					validation_ids.push(state.get_node(canon, bits));
				}

				if is_phony {
					// A degenerate `build foo: phony foo` would otherwise look
					// like a one-edge dependency cycle to `scan`. Repair it by
					// dropping the self-reference, the same way ninja does.
					let order_only_start = input_ids.len() - order_dep_count;
					let implicit_start = order_only_start - implicit_dep_count;
					let mut order_only_inputs = input_ids.split_off(order_only_start);
					let mut implicit_inputs = input_ids.split_off(implicit_start);

					let before = input_ids.len() + implicit_inputs.len() + order_only_inputs.len();
					input_ids.retain(|id| !output_ids.contains(id));
					implicit_inputs.retain(|id| !output_ids.contains(id));
					order_only_inputs.retain(|id| !output_ids.contains(id));
					let after = input_ids.len() + implicit_inputs.len() + order_only_inputs.len();

					implicit_dep_count = implicit_inputs.len();
					order_dep_count = order_only_inputs.len();
					input_ids.extend(implicit_inputs);
					input_ids.extend(order_only_inputs);

					if after < before {
						log::warn!(
							target: "ninj::spec",
							"{}: phony edge lists its own output as an input; ignoring",
							output_ids
								.first()
								.map(|&o| state.nodes[o].path.clone())
								.unwrap_or_else(RawString::new)
						);
					}
				}

				let dyndep = match dyndep_path {
					Some(p) => {
						let (canon, bits) = canon_path(p, loc)?;
						let id = state.get_node(canon, bits);
						if !input_ids.contains(&id) {
							input_ids.push(id);
						}
						Some(id)
					}
					None => None,
				};

				let edge_id = state.edges.len();
				for &out in &output_ids {
					state
						.add_out(out, edge_id)
						.map_err(|e| ReadError::DuplicateOutput(e.path).at(loc))?;
				}
				for &inp in &input_ids {
					state.add_in(inp, edge_id);
				}
				for &v in &validation_ids {
					state.add_in(v, edge_id);
				}

				state.edges.push(Edge {
					rule_name: rule_name.to_string(),
					is_phony,
					implicit_deps: implicit_dep_count,
					order_only_deps: order_dep_count,
					inputs: input_ids,
					outputs: output_ids,
					implicit_outs: implicit_output_count,
					validations: validation_ids,
					command,
					description,
					depfile,
					deps,
					msvc_deps_prefix,
					generator,
					restat,
					rspfile,
					rspfile_content,
					dyndep,
					pool: pool_name,
					outputs_ready: false,
					deps_missing: false,
					generated_by_dep_loader: false,
					mark: Mark::None,
					command_hash: None,
				});
			}
			Statement::Default { paths } => {
				for p in paths {
					let value = expand_str(p, scope).err_at(loc)?;
					let (canon, bits) = canon_path(value, loc)?;
					let id = state.get_node(canon, bits);
					state.default_targets.push(id);
				}
			}
			Statement::Include { path } => {
				let path = expand_str(path, scope).err_at(loc)?;
				let path = path.to_path().err_at(loc)?;
				let source = RawStr::from_bytes(pile.add(read_bytes(&path).err_at(loc)?));
				read_into(&file_name.with_file_name(path), source, pile, state, scope)?;
			}
			Statement::SubNinja { path } => {
				let path = expand_str(path, scope).err_at(loc)?;
				let path = path.to_path().err_at(loc)?;
				let source = RawStr::from_bytes(pile.add(read_bytes(&path).err_at(loc)?));
				let mut subscope = scope.new_subscope();
				read_into(&file_name.with_file_name(path), source, pile, state, &mut subscope)?;
			}
		}
	}

	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn parses_versions() {
		assert_eq!(parse_version("1"), Some((1, 0, 0)));
		assert_eq!(parse_version("1.2"), Some((1, 2, 0)));
		assert_eq!(parse_version("1.2.3"), Some((1, 2, 3)));
		assert_eq!(parse_version("1.2.3-dev"), Some((1, 2, 3)));
		assert_eq!(parse_version("not-a-version"), None);
	}

	#[test]
	fn a_required_version_within_support_is_accepted() {
		let source = b"ninja_required_version = 0.1\nbuild out: phony\n";
		read_from(Path::new("build.ninja"), source).unwrap();
	}

	#[test]
	fn a_required_version_too_new_is_rejected() {
		let source = b"ninja_required_version = 999.0\nbuild out: phony\n";
		let err = read_from(Path::new("build.ninja"), source).unwrap_err();
		match err.error {
			ReadError::UnsupportedVersion { .. } => {}
			other => panic!("expected UnsupportedVersion, got {:?}", other),
		}
	}

	#[test]
	fn a_malformed_required_version_is_rejected() {
		let source = b"ninja_required_version = banana\nbuild out: phony\n";
		let err = read_from(Path::new("build.ninja"), source).unwrap_err();
		match err.error {
			ReadError::InvalidVersion(_) => {}
			other => panic!("expected InvalidVersion, got {:?}", other),
		}
	}

	#[test]
	fn a_phony_edge_that_lists_its_own_output_as_an_input_is_repaired() {
		let source = b"build foo: phony foo\n";
		let state = read_from(Path::new("build.ninja"), source).unwrap();
		let foo = state.lookup_node(&RawString::from("foo")).unwrap();
		let edge = state.nodes[foo].in_edge.unwrap();
		assert!(state.edges[edge].inputs.is_empty());
	}

	#[test]
	fn a_phony_edge_with_other_inputs_keeps_them_after_repair() {
		let source = b"build foo: phony foo bar\n";
		let state = read_from(Path::new("build.ninja"), source).unwrap();
		let foo = state.lookup_node(&RawString::from("foo")).unwrap();
		let bar = state.lookup_node(&RawString::from("bar")).unwrap();
		let edge = state.nodes[foo].in_edge.unwrap();
		assert_eq!(state.edges[edge].inputs, vec![bar]);
	}
}
