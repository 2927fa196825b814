//! Deciding which edges are dirty (need to (re-)run) before a build starts.
//!
//! This generalizes the `outdated` check the build log and deps log were
//! originally read for: instead of an isolated rule-by-rule comparison, it
//! walks the whole [`State`] graph so that one edge's freshness can depend
//! on another's, extracts `gcc`/`msvc` deps bindings into extra implicit
//! inputs as it goes, and defers into a [`crate::dyndep`] file when an
//! edge's producer is ready but hasn't been loaded yet.

use crate::buildlog::BuildLogMut;
use crate::depfile::read_deps_file;
use crate::deplog::DepLogMut;
use crate::dyndep::{self, DyndepError};
use crate::error::ErrorWithLocation;
use crate::graph::{DepsKind, EdgeId, Mark, NodeId, State};
use crate::mtime::Timestamp;
use crate::path;
use raw_string::RawString;
use std::error::Error as StdError;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ScanError {
	/// A cycle in the build graph, given as the sequence of edges involved.
	Cycle(Vec<EdgeId>),
	Io(io::Error),
	Dyndep(ErrorWithLocation<DyndepError>),
}

impl fmt::Display for ScanError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			ScanError::Cycle(edges) => write!(f, "dependency cycle: {:?}", edges),
			ScanError::Io(e) => write!(f, "{}", e),
			ScanError::Dyndep(e) => write!(f, "{}", e),
		}
	}
}

impl StdError for ScanError {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		match self {
			ScanError::Io(e) => Some(e),
			ScanError::Dyndep(e) => Some(&e.error),
			ScanError::Cycle(_) => None,
		}
	}
}

impl From<io::Error> for ScanError {
	fn from(e: io::Error) -> Self {
		ScanError::Io(e)
	}
}
impl From<ErrorWithLocation<DyndepError>> for ScanError {
	fn from(e: ErrorWithLocation<DyndepError>) -> Self {
		ScanError::Dyndep(e)
	}
}

/// A DFS over the graph rooted at `target`, marking dirty edges and
/// extending them with any dependencies discovered along the way.
///
/// Returns the validation nodes of every edge visited, for the caller to
/// add as extra top-level goals.
pub fn recompute_dirty(
	state: &mut State,
	build_log: &BuildLogMut,
	dep_log: &mut DepLogMut,
	target: NodeId,
) -> Result<Vec<NodeId>, ScanError> {
	let mut validations = Vec::new();
	let mut stack = Vec::new();
	visit_node(state, build_log, dep_log, target, &mut stack, &mut validations)?;
	Ok(validations)
}

fn stat_node(state: &mut State, node: NodeId) -> Result<(), ScanError> {
	let n = &mut state.nodes[node];
	if !n.statted {
		let file = n.path.to_path().map_err(|_| {
			ScanError::Io(io::Error::new(io::ErrorKind::InvalidData, "path is not valid UTF-8"))
		})?;
		n.mtime = crate::mtime::mtime(&file)?;
		n.statted = true;
	}
	Ok(())
}

fn visit_node(
	state: &mut State,
	build_log: &BuildLogMut,
	dep_log: &mut DepLogMut,
	node: NodeId,
	stack: &mut Vec<EdgeId>,
	validations: &mut Vec<NodeId>,
) -> Result<(), ScanError> {
	match state.nodes[node].in_edge {
		Some(edge) => visit_edge(state, build_log, dep_log, edge, stack, validations),
		None => stat_node(state, node),
	}
}

fn visit_edge(
	state: &mut State,
	build_log: &BuildLogMut,
	dep_log: &mut DepLogMut,
	edge: EdgeId,
	stack: &mut Vec<EdgeId>,
	validations: &mut Vec<NodeId>,
) -> Result<(), ScanError> {
	match state.edges[edge].mark {
		Mark::Done => return Ok(()),
		Mark::InStack => {
			let start = stack.iter().position(|&e| e == edge).unwrap_or(0);
			return Err(ScanError::Cycle(stack[start..].to_vec()));
		}
		Mark::None => {}
	}

	state.edges[edge].mark = Mark::InStack;
	stack.push(edge);

	// Splice in any `gcc`/`msvc` deps binding's discovered inputs before
	// visiting inputs, so they get stat'd (and, if they're themselves a
	// build output, recursively scanned) in the same pass as the inputs
	// written in the manifest.
	load_discovered_deps(state, dep_log, edge)?;

	let inputs = state.edges[edge].inputs.clone();
	for inp in inputs {
		visit_node(state, build_log, dep_log, inp, stack, validations)?;
	}

	let edge_validations = state.edges[edge].validations.clone();
	for &v in &edge_validations {
		validations.push(v);
	}
	for v in edge_validations {
		visit_node(state, build_log, dep_log, v, stack, validations)?;
	}

	if let Some(dyndep_node) = state.edges[edge].dyndep {
		if state.nodes[dyndep_node].dyndep_pending {
			let producer_ready = match state.nodes[dyndep_node].in_edge {
				Some(producer) => {
					visit_edge(state, build_log, dep_log, producer, stack, validations)?;
					state.edges[producer].outputs_ready
				}
				None => true,
			};
			if producer_ready {
				dyndep::load_dyndep_file(state, dyndep_node)?;
			}
		}
	}

	let mut dirty = false;

	let most_recent_input = {
		let mut most_recent = None;
		for &inp in state.edges[edge].dirty_relevant_inputs() {
			if state.nodes[inp].dirty {
				dirty = true;
			}
			if let Some(mtime) = state.nodes[inp].mtime {
				if most_recent.map_or(true, |m| mtime > m) {
					most_recent = Some(mtime);
				}
			} else {
				// A missing, non-order-only input with no rule to build it
				// is still only discovered at build time; here we just note
				// that this edge can't be considered clean.
				dirty = true;
			}
		}
		most_recent
	};

	for &inp in state.edges[edge].order_only_inputs() {
		if state.nodes[inp].mtime.is_none() {
			dirty = true;
		}
	}

	if !state.edges[edge].is_phony {
		for &out in &state.edges[edge].outputs.clone() {
			stat_node(state, out)?;
			let out_path = state.nodes[out].path.clone();
			if state.nodes[out].mtime.is_none() {
				log::debug!(target: "ninj::scan", "{}: missing output", out_path);
				dirty = true;
				continue;
			}
			match build_log.get(&out_path) {
				Some(entry) => {
					let current_hash = state.edges[edge].hash();
					if entry.command_hash != current_hash {
						log::debug!(target: "ninj::scan", "{}: command line changed", out_path);
						dirty = true;
					} else if let Some(recorded) = entry.restat_mtime {
						if most_recent_input.map_or(false, |m| recorded < m) {
							log::debug!(target: "ninj::scan", "{}: output older than input", out_path);
							dirty = true;
						}
					}
				}
				None => {
					log::debug!(target: "ninj::scan", "{}: no entry in build log", out_path);
					dirty = true;
				}
			}
		}
	}

	if dirty {
		for &out in &state.edges[edge].outputs.clone() {
			state.nodes[out].dirty = true;
		}
		state.edges[edge].outputs_ready = false;
	} else {
		state.edges[edge].outputs_ready = true;
	}

	state.edges[edge].mark = Mark::Done;
	stack.pop();
	Ok(())
}

/// Extract the dependencies recorded by a `deps = gcc` or `deps = msvc`
/// binding and splice them in as extra implicit inputs, the same way §4.6
/// splices in a dyndep file's implicit inputs.
fn load_discovered_deps(
	state: &mut State,
	dep_log: &mut DepLogMut,
	edge: EdgeId,
) -> Result<(), ScanError> {
	match state.edges[edge].deps {
		DepsKind::None => Ok(()),
		DepsKind::Gcc => {
			let depfile = state.edges[edge].depfile.clone();
			if depfile.is_empty() {
				return Ok(());
			}
			let depfile_path = depfile.to_path().map_err(|_| {
				ScanError::Io(io::Error::new(io::ErrorKind::InvalidData, "depfile path is not valid UTF-8"))
			})?;
			let mut discovered: Vec<RawString> = Vec::new();
			match read_deps_file(&depfile_path, |_target, mut deps| {
				discovered.append(&mut deps);
				Ok(())
			}) {
				Ok(()) => {}
				Err(e) if e.kind() == io::ErrorKind::NotFound => {
					// The output exists (we wouldn't be here otherwise if it
					// didn't), but its depfile is gone: force a rebuild.
					state.nodes[state.edges[edge].outputs[0]].dirty = true;
					return Ok(());
				}
				Err(e) => return Err(e.into()),
			}
			for dep in discovered {
				let (canon, bits) = path_canon(&dep)?;
				let dep_id = state.get_node(canon, bits);
				ensure_placeholder_producer(state, dep_id);
				stat_node(state, dep_id)?;
				let insert_at = state.edges[edge].inputs.len() - state.edges[edge].order_only_deps;
				state.edges[edge].inputs.insert(insert_at, dep_id);
				state.edges[edge].implicit_deps += 1;
				state.add_in(dep_id, edge);
			}
			Ok(())
		}
		DepsKind::Msvc => {
			let out_node = state.edges[edge].outputs[0];
			stat_node(state, out_node)?;
			let output = state.nodes[out_node].path.clone();
			match dep_log.get(&output) {
				Some(info) => {
					let out_mtime = state.nodes[state.edges[edge].outputs[0]].mtime;
					if info.mtime() < out_mtime {
						state.nodes[state.edges[edge].outputs[0]].dirty = true;
					}
					let deps: Vec<RawString> = info.deps().map(|d| d.to_owned()).collect();
					for dep in deps {
						let (canon, bits) = path_canon(&dep)?;
						let dep_id = state.get_node(canon, bits);
						let insert_at =
							state.edges[edge].inputs.len() - state.edges[edge].order_only_deps;
						state.edges[edge].inputs.insert(insert_at, dep_id);
						state.edges[edge].implicit_deps += 1;
						state.add_in(dep_id, edge);
					}
				}
				None => {
					state.nodes[state.edges[edge].outputs[0]].dirty = true;
				}
			}
			Ok(())
		}
	}
}

/// A `gcc` depfile only ever names a dependency by path, with no notion of
/// which edge (if any) produces it. Give it a placeholder producing edge if
/// it doesn't already have one, so a later-loaded dyndep file (§4.6) has
/// something to claim and replace if it turns out this path is one of its
/// outputs after all.
fn ensure_placeholder_producer(state: &mut State, node: NodeId) {
	if state.nodes[node].in_edge.is_some() {
		return;
	}
	let edge_id = state.edges.len();
	state.edges.push(crate::graph::Edge {
		rule_name: crate::graph::PHONY_RULE.to_owned(),
		is_phony: true,
		inputs: Vec::new(),
		implicit_deps: 0,
		order_only_deps: 0,
		outputs: vec![node],
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
		generated_by_dep_loader: true,
		mark: Mark::None,
		command_hash: None,
	});
	state.nodes[node].in_edge = Some(edge_id);
}

fn path_canon(dep: &RawString) -> Result<(RawString, u64), ScanError> {
	let text = dep
		.to_str()
		.map_err(|_| ScanError::Io(io::Error::new(io::ErrorKind::InvalidData, "path is not valid UTF-8")))?;
	let (canon, bits) = path::canonicalize(text)
		.map_err(|_| ScanError::Io(io::Error::new(io::ErrorKind::InvalidData, "empty path")))?;
	Ok((RawString::from(canon), bits))
}

/// Re-examine a `restat` edge's outputs after it ran, without re-walking
/// its inputs: used by [`crate::plan::Plan::clean_node`] to decide if the
/// edges reading this output can be considered unaffected after all.
pub fn recompute_outputs_dirty(
	state: &mut State,
	build_log: &BuildLogMut,
	edge: EdgeId,
	most_recent_input: Option<Timestamp>,
) -> bool {
	let current_hash = state.edges[edge].hash();
	for &out in &state.edges[edge].outputs.clone() {
		let out_path = state.nodes[out].path.clone();
		match build_log.get(&out_path) {
			Some(entry) if entry.command_hash == current_hash => {
				if let Some(recorded) = entry.restat_mtime {
					if most_recent_input.map_or(false, |m| recorded < m) {
						return true;
					}
				} else {
					return true;
				}
			}
			_ => return true,
		}
	}
	false
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::graph::{Edge, PHONY_RULE};

	fn phony_edge(outputs: Vec<NodeId>, inputs: Vec<NodeId>) -> Edge {
		Edge {
			rule_name: PHONY_RULE.to_owned(),
			is_phony: true,
			inputs,
			implicit_deps: 0,
			order_only_deps: 0,
			outputs,
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

	fn build_edge(outputs: Vec<NodeId>, inputs: Vec<NodeId>, implicit_deps: usize) -> Edge {
		Edge {
			rule_name: "cc".to_owned(),
			command: RawString::from("cc -c in -o out"),
			implicit_deps,
			..phony_edge(outputs, inputs)
		}
	}

	fn open_logs(name: &str) -> (BuildLogMut, DepLogMut) {
		let build_log_path = std::env::temp_dir().join(format!("ninj-test-scan-{}.log", name));
		let dep_log_path = std::env::temp_dir().join(format!("ninj-test-scan-{}.deps", name));
		std::fs::remove_file(&build_log_path).ok();
		std::fs::remove_file(&dep_log_path).ok();
		(
			BuildLogMut::open(&build_log_path).unwrap(),
			DepLogMut::open(&dep_log_path).unwrap(),
		)
	}

	#[test]
	fn missing_output_is_dirty() {
		let (build_log, mut dep_log) = open_logs("missing-output");
		let mut state = State::new();
		let out = state.get_node(RawString::from("out-missing.txt"), 0);
		let edge = state.edges.len();
		state.edges.push(build_edge(vec![out], vec![], 0));
		state.add_out(out, edge).unwrap();

		let validations = recompute_dirty(&mut state, &build_log, &mut dep_log, out).unwrap();
		assert!(validations.is_empty());
		assert!(state.nodes[out].dirty);
		assert!(!state.edges[edge].outputs_ready);
	}

	#[test]
	fn source_with_no_producer_is_never_dirty() {
		let (build_log, mut dep_log) = open_logs("source-node");
		let mut state = State::new();
		// A node nobody builds (e.g. hand-written source) is only stat'd,
		// never marked dirty, regardless of whether it exists.
		let src = state.get_node(RawString::from("Cargo.toml"), 0);

		recompute_dirty(&mut state, &build_log, &mut dep_log, src).unwrap();
		assert!(!state.nodes[src].dirty);
		assert!(state.nodes[src].statted);
	}

	#[test]
	fn self_cycle_is_detected() {
		let (build_log, mut dep_log) = open_logs("cycle");
		let mut state = State::new();
		let a = state.get_node(RawString::from("a.txt"), 0);
		let edge = state.edges.len();
		state.edges.push(build_edge(vec![a], vec![a], 0));
		state.add_out(a, edge).unwrap();
		state.add_in(a, edge);

		let err = recompute_dirty(&mut state, &build_log, &mut dep_log, a).unwrap_err();
		match err {
			ScanError::Cycle(edges) => assert_eq!(edges, vec![edge]),
			other => panic!("expected a cycle, got {:?}", other),
		}
	}

	#[test]
	fn matching_build_log_entry_keeps_a_phony_edge_clean() {
		let (build_log, mut dep_log) = open_logs("phony-clean");
		let mut state = State::new();
		let out = state.get_node(RawString::from("out-phony.txt"), 0);
		let edge = state.edges.len();
		state.edges.push(phony_edge(vec![out], vec![]));
		state.add_out(out, edge).unwrap();

		// Phony edges never consult the build log or check for a missing
		// output file, so with no inputs this edge is always clean.
		recompute_dirty(&mut state, &build_log, &mut dep_log, out).unwrap();
		assert!(!state.nodes[out].dirty);
		assert!(state.edges[edge].outputs_ready);
	}

	#[test]
	fn validations_are_collected_and_visited() {
		let (build_log, mut dep_log) = open_logs("validations");
		let mut state = State::new();
		let out = state.get_node(RawString::from("out-val.txt"), 0);
		let check = state.get_node(RawString::from("check-val.txt"), 0);
		let check_edge = state.edges.len();
		state.edges.push(phony_edge(vec![check], vec![]));
		state.add_out(check, check_edge).unwrap();

		let edge = state.edges.len();
		let mut e = phony_edge(vec![out], vec![]);
		e.validations.push(check);
		state.edges.push(e);
		state.add_out(out, edge).unwrap();
		state.add_in(check, edge);

		let validations = recompute_dirty(&mut state, &build_log, &mut dep_log, out).unwrap();
		assert_eq!(validations, vec![check]);
		assert_eq!(state.edges[check_edge].mark, Mark::Done);
	}

	#[test]
	fn gcc_depfile_dependency_is_spliced_in_and_stat() {
		let (build_log, mut dep_log) = open_logs("gcc-depfile");
		let depfile_path = std::env::temp_dir().join("ninj-test-scan-gcc.d");
		std::fs::write(&depfile_path, b"out-gcc.o: Cargo.toml\n").unwrap();

		let mut state = State::new();
		let out = state.get_node(RawString::from("out-gcc.o"), 0);
		let edge = state.edges.len();
		let mut e = build_edge(vec![out], vec![], 0);
		e.deps = DepsKind::Gcc;
		e.depfile = RawString::from(depfile_path.to_str().unwrap());
		state.edges.push(e);
		state.add_out(out, edge).unwrap();

		recompute_dirty(&mut state, &build_log, &mut dep_log, out).unwrap();
		assert_eq!(state.edges[edge].implicit_deps, 1);
		let dep = state.edges[edge].inputs[0];
		assert_eq!(state.nodes[dep].path, RawString::from("Cargo.toml"));
		assert!(state.nodes[dep].statted);
		assert!(state.nodes[dep].in_edge.is_some());

		std::fs::remove_file(&depfile_path).ok();
	}

	#[test]
	fn missing_gcc_depfile_forces_a_rebuild() {
		let (build_log, mut dep_log) = open_logs("gcc-depfile-missing");
		let mut state = State::new();
		let out = state.get_node(RawString::from("out-gcc-missing.o"), 0);
		let edge = state.edges.len();
		let mut e = build_edge(vec![out], vec![], 0);
		e.deps = DepsKind::Gcc;
		e.depfile = RawString::from("ninj-test-scan-nonexistent.d");
		state.edges.push(e);
		state.add_out(out, edge).unwrap();

		recompute_dirty(&mut state, &build_log, &mut dep_log, out).unwrap();
		assert!(state.nodes[out].dirty);
	}
}
