//! Loading `dyndep` files: small manifests, discovered mid-build, that
//! augment an already-parsed edge with implicit inputs/outputs it couldn't
//! have known about when `build.ninja` was read (e.g. a Fortran module
//! dependency, or extra outputs a code generator decided to emit).
//!
//! The file uses the same `build` statement grammar as a regular manifest,
//! restricted to a single sentinel rule (`dyndep`) with no explicit or
//! order-only dependencies and no validations, so [`crate::spec::parse`]
//! is reused as-is.

use crate::error::{AddLocationToError, AddLocationToResult, ErrorWithLocation, Location};
use crate::graph::{EdgeId, NodeId, State};
use crate::path;
use crate::spec::error::{ExpansionError, ParseError};
use crate::spec::eval::{expand_str, FoundVar, VarScope};
use crate::spec::parse::{Parser, Statement};
use raw_string::RawString;
use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// The one rule name a dyndep build statement is allowed to use.
const DYNDEP_RULE: &str = "dyndep";

#[derive(Debug)]
pub enum DyndepError {
	ParseError(ParseError),
	ExpansionError(ExpansionError),
	/// Missing or malformed `ninja_dyndep_version = 1` declaration.
	BadVersion(RawString),
	/// A statement used a rule other than `dyndep`.
	WrongRule(String),
	/// A `dyndep` build statement had explicit or order-only dependencies.
	RestrictedDeps,
	/// A `dyndep` build statement had validations (`|@`).
	RestrictedValidations,
	/// A binding other than `restat` under a `dyndep` build statement.
	UnknownVariable(String),
	/// One of a statement's identifying outputs doesn't match any known
	/// edge output.
	UnclaimedOutput(RawString),
	/// A statement's identifying outputs spread across more than one edge.
	SplitOutputs(RawString),
	/// Two statements in the same file augment the same edge.
	DuplicateStatementForEdge(RawString),
	/// The edge a statement augments has no `dyndep` binding pointing at
	/// this file.
	NoDyndepBinding(RawString),
	/// A new output is already claimed by a real (non-placeholder) edge.
	OutputAlreadyClaimed(RawString),
	EmptyPath,
	Io { file_name: std::path::PathBuf, error: std::io::Error },
}

impl fmt::Display for DyndepError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			DyndepError::ParseError(e) => write!(f, "{}", e),
			DyndepError::ExpansionError(e) => write!(f, "{}", e),
			DyndepError::BadVersion(v) => write!(f, "Unsupported ninja_dyndep_version: {}", v),
			DyndepError::WrongRule(r) => write!(f, "Expected rule `dyndep`, found `{}`", r),
			DyndepError::RestrictedDeps => {
				write!(f, "dyndep files may not use explicit or order-only dependencies")
			}
			DyndepError::RestrictedValidations => write!(f, "dyndep files may not use validations"),
			DyndepError::UnknownVariable(v) => write!(f, "Unexpected binding in dyndep file: {}", v),
			DyndepError::UnclaimedOutput(p) => {
				write!(f, "{} is not the output of any known edge", p)
			}
			DyndepError::SplitOutputs(p) => {
				write!(f, "outputs of a dyndep build statement belong to more than one edge (near {})", p)
			}
			DyndepError::DuplicateStatementForEdge(p) => {
				write!(f, "multiple dyndep build statements for the edge producing {}", p)
			}
			DyndepError::NoDyndepBinding(p) => {
				write!(f, "edge producing {} has no dyndep binding", p)
			}
			DyndepError::OutputAlreadyClaimed(p) => {
				write!(f, "{} is already an output of another edge", p)
			}
			DyndepError::EmptyPath => write!(f, "Empty path"),
			DyndepError::Io { file_name, error } => write!(f, "Unable to read {:?}: {}", file_name, error),
		}
	}
}

impl StdError for DyndepError {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		match self {
			DyndepError::Io { error, .. } => Some(error),
			_ => None,
		}
	}
}

impl From<ParseError> for DyndepError {
	fn from(e: ParseError) -> Self {
		DyndepError::ParseError(e)
	}
}
impl From<ExpansionError> for DyndepError {
	fn from(e: ExpansionError) -> Self {
		DyndepError::ExpansionError(e)
	}
}
impl From<ErrorWithLocation<ParseError>> for ErrorWithLocation<DyndepError> {
	fn from(src: ErrorWithLocation<ParseError>) -> Self {
		src.convert()
	}
}
impl From<ErrorWithLocation<ExpansionError>> for ErrorWithLocation<DyndepError> {
	fn from(src: ErrorWithLocation<ExpansionError>) -> Self {
		src.convert()
	}
}
impl From<std::str::Utf8Error> for DyndepError {
	fn from(_: std::str::Utf8Error) -> Self {
		DyndepError::EmptyPath
	}
}
impl From<ErrorWithLocation<std::str::Utf8Error>> for ErrorWithLocation<DyndepError> {
	fn from(src: ErrorWithLocation<std::str::Utf8Error>) -> Self {
		src.convert()
	}
}

/// A scope with no variables: dyndep files aren't nested in any manifest's
/// scope, so `$foo` for an undefined `foo` simply expands to nothing, same
/// as it would at the top of an otherwise-empty `build.ninja`.
struct EmptyScope;
impl VarScope for EmptyScope {
	fn lookup_var(&self, _var_name: &str) -> Option<FoundVar> {
		None
	}
}

fn canon_path(raw: RawString, loc: Location) -> Result<(RawString, u64), ErrorWithLocation<DyndepError>> {
	let text = raw
		.to_str()
		.map_err(|_| DyndepError::EmptyPath)
		.err_at(loc)?;
	let (canon, bits) = path::canonicalize(text)
		.map_err(|_| DyndepError::EmptyPath)
		.err_at(loc)?;
	Ok((RawString::from(canon), bits))
}

fn read_bytes(file_name: &Path) -> Result<Vec<u8>, DyndepError> {
	let mut bytes = Vec::new();
	File::open(file_name)
		.and_then(|mut f| f.read_to_end(&mut bytes))
		.map_err(|error| DyndepError::Io {
			file_name: file_name.to_owned(),
			error,
		})?;
	Ok(bytes)
}

/// Read and apply the dyndep file bound to `node` (a node that some edge
/// declared via its `dyndep = ...` binding), augmenting the edges it
/// names and clearing `node`'s `dyndep_pending` flag.
pub fn load_dyndep_file(
	state: &mut State,
	node: NodeId,
) -> Result<(), ErrorWithLocation<DyndepError>> {
	let file_name = state.nodes[node]
		.path
		.clone()
		.to_path()
		.err_at(Location::UNKNOWN)?;
	let source = read_bytes(&file_name).err_at(Location::UNKNOWN)?;
	apply_dyndep_file(state, node, &file_name, &source)
}

fn apply_dyndep_file(
	state: &mut State,
	file_node: NodeId,
	file_name: &Path,
	source: &[u8],
) -> Result<(), ErrorWithLocation<DyndepError>> {
	use raw_string::RawStr;

	let mut parser = Parser::new(file_name, RawStr::from_bytes(source));
	let scope = EmptyScope;

	let version_stmt = parser
		.next_statement()?
		.ok_or_else(|| DyndepError::BadVersion(RawString::from("")).at(parser.location()))?;
	let loc = parser.location();
	match version_stmt {
		Statement::Variable { name, value } if name == "ninja_dyndep_version" => {
			let version = expand_str(value, &scope).err_at(loc)?;
			if !is_supported_version(&version) {
				return Err(DyndepError::BadVersion(version).at(loc));
			}
		}
		_ => return Err(DyndepError::BadVersion(RawString::from("")).at(loc)),
	}

	let mut seen_edges = HashSet::new();

	while let Some(statement) = parser.next_statement()? {
		let loc = parser.location();
		let build = match statement {
			Statement::Build {
				rule_name,
				explicit_outputs,
				implicit_outputs,
				explicit_deps,
				implicit_deps,
				order_deps,
				validations,
			} => {
				if rule_name != DYNDEP_RULE {
					return Err(DyndepError::WrongRule(rule_name.to_owned()).at(loc));
				}
				if !explicit_deps.is_empty() || !order_deps.is_empty() {
					return Err(DyndepError::RestrictedDeps.at(loc));
				}
				if !validations.is_empty() {
					return Err(DyndepError::RestrictedValidations.at(loc));
				}
				(explicit_outputs, implicit_outputs, implicit_deps)
			}
			_ => return Err(DyndepError::WrongRule(String::new()).at(loc)),
		};

		let mut restat = None;
		while let Some(var) = parser.next_variable()? {
			if var.name != "restat" {
				return Err(DyndepError::UnknownVariable(var.name.to_owned()).at(parser.location()));
			}
			restat = Some(true);
		}

		let (identifying_outputs, new_outputs, new_inputs) = build;

		let mut edge_id: Option<EdgeId> = None;
		let mut first_output_path = RawString::new();
		for out in identifying_outputs {
			let out = expand_str(out, &scope).err_at(loc)?;
			let (canon, bits) = canon_path(out, loc)?;
			if first_output_path.is_empty() {
				first_output_path = canon.clone();
			}
			let node = state
				.lookup_node(&canon)
				.ok_or_else(|| DyndepError::UnclaimedOutput(canon.clone()).at(loc))?;
			let this_edge = state.nodes[node]
				.in_edge
				.ok_or_else(|| DyndepError::UnclaimedOutput(canon.clone()).at(loc))?;
			match edge_id {
				None => edge_id = Some(this_edge),
				Some(e) if e == this_edge => {}
				Some(_) => return Err(DyndepError::SplitOutputs(canon).at(loc)),
			}
			let _ = bits;
		}
		let edge_id = edge_id.ok_or_else(|| DyndepError::UnclaimedOutput(RawString::from("")).at(loc))?;

		if !seen_edges.insert(edge_id) {
			return Err(DyndepError::DuplicateStatementForEdge(first_output_path).at(loc));
		}

		if state.edges[edge_id].dyndep != Some(file_node) {
			return Err(DyndepError::NoDyndepBinding(first_output_path).at(loc));
		}

		for out in new_outputs {
			let out = expand_str(out, &scope).err_at(loc)?;
			let (canon, bits) = canon_path(out, loc)?;
			let out_id = state.get_node(canon.clone(), bits);
			match state.nodes[out_id].in_edge {
				None => {
					state.nodes[out_id].in_edge = Some(edge_id);
				}
				Some(e) if e == edge_id => {}
				Some(e) if state.edges[e].generated_by_dep_loader => {
					state.edges[e].outputs.retain(|&n| n != out_id);
					state.nodes[out_id].in_edge = Some(edge_id);
				}
				Some(_) => return Err(DyndepError::OutputAlreadyClaimed(canon).at(loc)),
			}
			state.edges[edge_id].outputs.push(out_id);
			state.edges[edge_id].implicit_outs += 1;
		}

		for dep in new_inputs {
			let dep = expand_str(dep, &scope).err_at(loc)?;
			let (canon, bits) = canon_path(dep, loc)?;
			let in_id = state.get_node(canon, bits);
			let edge = &mut state.edges[edge_id];
			let insert_at = edge.inputs.len() - edge.order_only_deps;
			edge.inputs.insert(insert_at, in_id);
			edge.implicit_deps += 1;
			state.add_in(in_id, edge_id);
		}

		if restat.is_some() {
			state.edges[edge_id].restat = true;
		}
	}

	state.nodes[file_node].dyndep_pending = false;

	Ok(())
}

fn is_supported_version(v: &RawString) -> bool {
	let v = match v.to_str() {
		Ok(v) => v,
		Err(_) => return false,
	};
	v == "1" || v == "1.0" || v.starts_with("1-") || v.starts_with("1.0-")
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::graph::{DepsKind, Edge, Mark};
	use raw_string::RawString;

	fn blank_edge(rule_name: &str) -> Edge {
		Edge {
			rule_name: rule_name.to_owned(),
			is_phony: false,
			inputs: Vec::new(),
			implicit_deps: 0,
			order_only_deps: 0,
			outputs: Vec::new(),
			implicit_outs: 0,
			validations: Vec::new(),
			command: RawString::new(),
			description: RawString::new(),
			depfile: RawString::new(),
			deps: DepsKind::None,
			msvc_deps_prefix: RawString::new(),
			generator: false,
			restat: false,
			rspfile: RawString::new(),
			rspfile_content: RawString::new(),
			dyndep: None,
			pool: String::new(),
			outputs_ready: false,
			deps_missing: false,
			generated_by_dep_loader: false,
			mark: Mark::None,
			command_hash: None,
		}
	}

	#[test]
	fn adds_implicit_outputs_and_inputs() {
		let mut state = State::new();
		let out = state.get_node(RawString::from("out"), 0);
		let dd_file = state.get_node(RawString::from("out.dd"), 0);

		let mut edge = blank_edge("cc");
		edge.outputs.push(out);
		edge.dyndep = Some(dd_file);
		state.edges.push(edge);
		state.nodes[out].in_edge = Some(0);
		state.nodes[dd_file].dyndep_pending = true;

		let source = b"ninja_dyndep_version = 1\nbuild out | extra.h : dyndep | mod.o\n";
		apply_dyndep_file(&mut state, dd_file, Path::new("out.dd"), source).unwrap();

		assert!(!state.nodes[dd_file].dyndep_pending);
		assert_eq!(state.edges[0].implicit_outs, 1);
		assert_eq!(state.edges[0].implicit_deps, 1);
		let new_out = state.lookup_node(&RawString::from("extra.h")).unwrap();
		assert_eq!(state.nodes[new_out].in_edge, Some(0));
	}

	#[test]
	fn rejects_unclaimed_output() {
		let mut state = State::new();
		let dd_file = state.get_node(RawString::from("out.dd"), 0);
		let source = b"ninja_dyndep_version = 1\nbuild nope : dyndep\n";
		assert!(apply_dyndep_file(&mut state, dd_file, Path::new("out.dd"), source).is_err());
	}

	#[test]
	fn rejects_bad_version() {
		let mut state = State::new();
		let dd_file = state.get_node(RawString::from("out.dd"), 0);
		let source = b"ninja_dyndep_version = 2\n";
		assert!(apply_dyndep_file(&mut state, dd_file, Path::new("out.dd"), source).is_err());
	}
}
