//! The build graph: [`Node`]s, [`Edge`]s, [`Rule`]s, [`Pool`]s, and the
//! [`State`] arena that owns them all.
//!
//! Nodes and edges reference each other by index into `State::nodes` and
//! `State::edges` rather than through pointers or `Rc`, which keeps the
//! graph simple to build incrementally (including the in-place edge
//! augmentation that dyndep performs, see [`crate::dyndep`]) and gives the
//! deps log a natural place to hang its own integer ids.

use crate::mtime::Timestamp;
use raw_string::RawString;
use std::collections::HashMap;
use std::collections::VecDeque;

/// Index of a [`Node`] in [`State::nodes`].
pub type NodeId = usize;
/// Index of an [`Edge`] in [`State::edges`].
pub type EdgeId = usize;

/// The reserved name of the built-in rule that does nothing.
pub const PHONY_RULE: &str = "phony";
/// The reserved name of the pool that serializes access to the terminal.
pub const CONSOLE_POOL: &str = "console";

/// A file (or directory) in the build graph.
#[derive(Debug)]
pub struct Node {
	/// The canonical path.
	pub path: RawString,
	/// Which separators in the originally-written path were `\`.
	pub slash_bits: u64,
	/// The last-observed modification time. `None` until the node has been
	/// stat'd this run, or once it is known not to exist.
	pub mtime: Option<Timestamp>,
	/// Whether this node has been stat'd yet this run.
	pub statted: bool,
	/// Recomputed on every dependency scan.
	pub dirty: bool,
	/// This node is a `dyndep` binding whose file has not yet been loaded.
	pub dyndep_pending: bool,
	/// The edge that produces this node, if any.
	pub in_edge: Option<EdgeId>,
	/// All edges that reference this node, either as an input or as a
	/// validation target.
	pub out_edges: Vec<EdgeId>,
	/// The id assigned to this node the first time it appeared in the deps
	/// log, in this run or a previous one.
	pub deps_log_id: Option<u32>,
}

impl Node {
	fn new(path: RawString, slash_bits: u64) -> Self {
		Node {
			path,
			slash_bits,
			mtime: None,
			statted: false,
			dirty: false,
			dyndep_pending: false,
			in_edge: None,
			out_edges: Vec::new(),
			deps_log_id: None,
		}
	}

	/// Whether the node exists on disk, as of the last stat.
	pub fn exists(&self) -> bool {
		self.mtime.is_some()
	}
}

/// How an edge discovers additional dependencies beyond what's written in
/// the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepsKind {
	None,
	Gcc,
	Msvc,
}

/// Cycle-detection color used by [`crate::scan::recompute_dirty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
	None,
	InStack,
	Done,
}

/// A named template of bindings, instantiated by [`Edge`]s.
///
/// Only the name is kept once parsing is done: all bindings relevant to
/// building are resolved into concrete fields on the [`Edge`] at parse
/// time (see [`crate::spec::parse`]), matching how the rest of this graph
/// avoids late string lookups during the build.
#[derive(Debug)]
pub struct Rule {
	pub name: String,
}

/// A bounded concurrency domain.
#[derive(Debug)]
pub struct Pool {
	pub name: String,
	/// `0` means unlimited.
	pub depth: u32,
	pub in_flight: u32,
	/// Edges that want this pool but didn't fit when they became ready.
	pub delayed: VecDeque<EdgeId>,
}

impl Pool {
	pub fn new(name: impl Into<String>, depth: u32) -> Self {
		Pool {
			name: name.into(),
			depth,
			in_flight: 0,
			delayed: VecDeque::new(),
		}
	}

	pub fn is_full(&self) -> bool {
		self.depth != 0 && self.in_flight >= self.depth
	}
}

/// One invocation of a rule, producing `outputs` from `inputs`.
#[derive(Debug)]
pub struct Edge {
	pub rule_name: String,
	pub is_phony: bool,

	/// Explicit ‖ implicit ‖ order-only inputs, partitioned from the right
	/// by `implicit_deps` and `order_only_deps`.
	pub inputs: Vec<NodeId>,
	pub implicit_deps: usize,
	pub order_only_deps: usize,

	/// Explicit ‖ implicit outputs, partitioned from the right by
	/// `implicit_outs`.
	pub outputs: Vec<NodeId>,
	pub implicit_outs: usize,

	/// Extra top-level goals added whenever this edge is requested, which
	/// do not gate the edge itself.
	pub validations: Vec<NodeId>,

	pub command: RawString,
	pub description: RawString,
	pub depfile: RawString,
	pub deps: DepsKind,
	pub msvc_deps_prefix: RawString,
	pub generator: bool,
	pub restat: bool,
	pub rspfile: RawString,
	pub rspfile_content: RawString,
	/// The node holding this edge's `dyndep` binding, if any. Always also
	/// present among `inputs`.
	pub dyndep: Option<NodeId>,
	pub pool: String,

	pub outputs_ready: bool,
	pub deps_missing: bool,
	pub generated_by_dep_loader: bool,
	pub mark: Mark,

	/// Hash of the fully-evaluated `command`, cached once computed.
	pub command_hash: Option<u64>,
}

impl Edge {
	pub fn explicit_input_count(&self) -> usize {
		self.inputs.len() - self.implicit_deps - self.order_only_deps
	}
	pub fn explicit_inputs(&self) -> &[NodeId] {
		&self.inputs[..self.explicit_input_count()]
	}
	pub fn implicit_inputs(&self) -> &[NodeId] {
		let e = self.explicit_input_count();
		&self.inputs[e..e + self.implicit_deps]
	}
	pub fn order_only_inputs(&self) -> &[NodeId] {
		let start = self.inputs.len() - self.order_only_deps;
		&self.inputs[start..]
	}
	/// All inputs whose mtime contributes to dirtiness (everything except
	/// order-only dependencies).
	pub fn dirty_relevant_inputs(&self) -> &[NodeId] {
		let start = self.inputs.len() - self.order_only_deps;
		&self.inputs[..start]
	}

	pub fn explicit_output_count(&self) -> usize {
		self.outputs.len() - self.implicit_outs
	}
	pub fn explicit_outputs(&self) -> &[NodeId] {
		&self.outputs[..self.explicit_output_count()]
	}
	pub fn implicit_outputs(&self) -> &[NodeId] {
		&self.outputs[self.explicit_output_count()..]
	}

	pub fn hash(&mut self) -> u64 {
		*self
			.command_hash
			.get_or_insert_with(|| crate::buildlog::murmur_hash_64a(self.command.as_bytes()))
	}
}

/// Error raised when two edges claim the same output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateOutput {
	pub path: RawString,
}

/// The whole build graph, plus the ancillary tables used while building it:
/// the pool table and the ordered list of default targets.
#[derive(Debug, Default)]
pub struct State {
	pub nodes: Vec<Node>,
	path_index: HashMap<RawString, NodeId>,
	pub edges: Vec<Edge>,
	pub rules: Vec<Rule>,
	pub pools: Vec<Pool>,
	pub default_targets: Vec<NodeId>,
	pub build_dir: Option<RawString>,
}

impl State {
	pub fn new() -> Self {
		let mut state = State::default();
		// The console pool always exists, with depth 1.
		state.pools.push(Pool::new(CONSOLE_POOL, 1));
		state
	}

	/// Look up or intern a node by its already-canonical path.
	pub fn get_node(&mut self, path: RawString, slash_bits: u64) -> NodeId {
		if let Some(&id) = self.path_index.get(&path) {
			return id;
		}
		let id = self.nodes.len();
		self.path_index.insert(path.clone(), id);
		self.nodes.push(Node::new(path, slash_bits));
		id
	}

	/// Look up a node that must already exist.
	pub fn lookup_node(&self, path: &RawString) -> Option<NodeId> {
		self.path_index.get(path).copied()
	}

	pub fn lookup_pool(&self, name: &str) -> Option<usize> {
		self.pools.iter().position(|p| p.name == name)
	}

	pub fn pool_for_edge(&self, edge: &Edge) -> Option<usize> {
		if edge.pool.is_empty() {
			None
		} else {
			self.lookup_pool(&edge.pool)
		}
	}

	/// Record that `edge` produces `node`, enforcing the single-producer
	/// invariant.
	pub fn add_out(&mut self, node: NodeId, edge: EdgeId) -> Result<(), DuplicateOutput> {
		if let Some(existing) = self.nodes[node].in_edge {
			if existing != edge {
				return Err(DuplicateOutput {
					path: self.nodes[node].path.clone(),
				});
			}
		}
		self.nodes[node].in_edge = Some(edge);
		Ok(())
	}

	/// Record that `edge` reads (or validates) `node`.
	pub fn add_in(&mut self, node: NodeId, edge: EdgeId) {
		self.nodes[node].out_edges.push(edge);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn interning_shares_nodes() {
		let mut state = State::new();
		let a = state.get_node(RawString::from("foo"), 0);
		let b = state.get_node(RawString::from("foo"), 0);
		assert_eq!(a, b);
		let c = state.get_node(RawString::from("bar"), 0);
		assert_ne!(a, c);
	}

	#[test]
	fn single_producer_is_enforced() {
		let mut state = State::new();
		let out = state.get_node(RawString::from("out"), 0);
		state.add_out(out, 0).unwrap();
		assert!(state.add_out(out, 1).is_err());
		// Re-declaring the same edge as producer is fine (idempotent).
		assert!(state.add_out(out, 0).is_ok());
	}
}
