//! The work-wanting state machine: which edges still need to run, which of
//! those are blocked on other edges, and which are ready to start right now.
//!
//! Grounded on the teacher's `src/queue.rs` `BuildQueue`: a dependency count
//! per task, decremented as dependencies finish, feeding a ready stack.
//! This generalizes that from a flat `Vec<BuildRule>` walked once at start
//! of day to the [`crate::graph::State`] DAG, where pools gate how many
//! ready edges can actually run at once, and finishing a node can itself
//! trigger a dyndep file load that adds more edges to want.

use crate::buildlog::BuildLogMut;
use crate::deplog::DepLogMut;
use crate::dyndep;
use crate::edgeset::EdgeSet;
use crate::graph::{EdgeId, NodeId, State};
use crate::scan::{self, ScanError};
use std::collections::HashMap;

/// Where an edge stands with respect to being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantState {
	/// Not wanted: either clean, or not part of any requested target.
	Nothing,
	/// Wanted, but still waiting on an input to finish.
	ToStart,
	/// Scheduled (in `ready` or a pool's `delayed` queue, or running).
	ToFinish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeResult {
	Success,
	Failure,
}

/// Tracks which edges a build still needs, and hands them out in an order
/// that respects pool concurrency limits.
#[derive(Debug, Default)]
pub struct Plan {
	want: HashMap<EdgeId, WantState>,
	ready: EdgeSet,
	wanted_edges: usize,
}

impl Plan {
	pub fn new() -> Self {
		Plan::default()
	}

	/// Whether there's any more work to admit or wait for.
	pub fn more_to_do(&self) -> bool {
		self.wanted_edges > 0
	}

	/// How many edges this plan still wants built.
	pub fn edge_count(&self) -> usize {
		self.wanted_edges
	}

	pub fn want_state(&self, edge: EdgeId) -> WantState {
		self.want.get(&edge).copied().unwrap_or(WantState::Nothing)
	}

	/// Add `target`'s producing edge (and transitively, its inputs'
	/// producing edges) as something this plan needs built. `target` must
	/// already have had its dirtiness computed by
	/// [`scan::recompute_dirty`].
	pub fn add_target(&mut self, state: &mut State, target: NodeId) {
		if let Some(edge) = state.nodes[target].in_edge {
			self.add_edge(state, edge);
		}
	}

	fn add_edge(&mut self, state: &mut State, edge: EdgeId) {
		if self.want.contains_key(&edge) || state.edges[edge].outputs_ready {
			return;
		}
		self.want.insert(edge, WantState::ToStart);
		self.wanted_edges += 1;

		let inputs = state.edges[edge].inputs.clone();
		for inp in inputs {
			if let Some(producer) = state.nodes[inp].in_edge {
				self.add_edge(state, producer);
			}
		}

		if self.all_inputs_ready(state, edge) {
			self.schedule(state, edge);
		}
	}

	/// An input is ready either because nothing produces it (it's a source
	/// file) or because its producing edge isn't something this plan is
	/// still waiting on.
	fn all_inputs_ready(&self, state: &State, edge: EdgeId) -> bool {
		state.edges[edge].inputs.iter().all(|&inp| match state.nodes[inp].in_edge {
			None => true,
			Some(producer) => self.want_state(producer) == WantState::Nothing,
		})
	}

	fn schedule(&mut self, state: &mut State, edge: EdgeId) {
		self.want.insert(edge, WantState::ToFinish);
		match state.pool_for_edge(&state.edges[edge]) {
			Some(pool_idx) if state.pools[pool_idx].is_full() => {
				state.pools[pool_idx].delayed.push_back(edge);
			}
			Some(pool_idx) => {
				state.pools[pool_idx].in_flight += 1;
				self.ready.add(edge);
			}
			None => self.ready.add(edge),
		}
	}

	/// Release `pool_idx`'s slot held by a finished edge, and promote any
	/// delayed edges that now fit.
	fn release_pool_slot(&mut self, state: &mut State, pool_idx: usize) {
		state.pools[pool_idx].in_flight -= 1;
		while !state.pools[pool_idx].is_full() {
			match state.pools[pool_idx].delayed.pop_front() {
				Some(edge) => {
					state.pools[pool_idx].in_flight += 1;
					self.ready.add(edge);
				}
				None => break,
			}
		}
	}

	/// The next edge ready to run, if any.
	pub fn find_work(&mut self) -> Option<EdgeId> {
		self.ready.pop()
	}

	/// Record that `edge` finished (successfully or not), propagating the
	/// result to whatever it unblocks.
	pub fn edge_finished(
		&mut self,
		state: &mut State,
		dep_log: &mut DepLogMut,
		edge: EdgeId,
		result: EdgeResult,
	) -> Result<(), ScanError> {
		if let Some(pool_idx) = state.pool_for_edge(&state.edges[edge]) {
			self.release_pool_slot(state, pool_idx);
		}
		if let Some(ws) = self.want.remove(&edge) {
			if ws != WantState::Nothing {
				self.wanted_edges -= 1;
			}
		}

		if result == EdgeResult::Success {
			state.edges[edge].outputs_ready = true;
			let outputs = state.edges[edge].outputs.clone();
			for out in outputs {
				self.node_finished(state, dep_log, out)?;
			}
		}
		Ok(())
	}

	fn node_finished(&mut self, state: &mut State, dep_log: &mut DepLogMut, node: NodeId) -> Result<(), ScanError> {
		if state.nodes[node].dyndep_pending {
			dyndep::load_dyndep_file(state, node)?;
			self.dyndeps_loaded(state, dep_log, node)?;
		}
		let out_edges = state.nodes[node].out_edges.clone();
		for out_edge in out_edges {
			if self.want_state(out_edge) == WantState::ToStart && self.all_inputs_ready(state, out_edge) {
				self.schedule(state, out_edge);
			}
		}
		Ok(())
	}

	/// Used when a `restat` edge's outputs turn out not to have changed:
	/// propagate cleanness forward instead of re-running everything that
	/// reads `node`.
	pub fn clean_node(&mut self, state: &mut State, build_log: &BuildLogMut, node: NodeId) {
		state.nodes[node].dirty = false;
		let out_edges = state.nodes[node].out_edges.clone();
		for out_edge in out_edges {
			if state.edges[out_edge]
				.dirty_relevant_inputs()
				.iter()
				.any(|&inp| state.nodes[inp].dirty)
			{
				continue;
			}

			let most_recent_input = state.edges[out_edge]
				.dirty_relevant_inputs()
				.iter()
				.filter_map(|&inp| state.nodes[inp].mtime)
				.max();
			if scan::recompute_outputs_dirty(state, build_log, out_edge, most_recent_input) {
				continue;
			}

			state.edges[out_edge].outputs_ready = true;
			if let Some(ws) = self.want.remove(&out_edge) {
				if ws != WantState::Nothing {
					self.wanted_edges -= 1;
				}
			}
			let outputs = state.edges[out_edge].outputs.clone();
			for out in outputs {
				self.clean_node(state, build_log, out);
			}
		}
	}

	/// After a dyndep file has augmented the edges that reference `node`,
	/// bring their new inputs into this plan and reschedule anything that's
	/// now ready.
	fn dyndeps_loaded(&mut self, state: &mut State, _dep_log: &mut DepLogMut, node: NodeId) -> Result<(), ScanError> {
		let affected = state.nodes[node].out_edges.clone();
		for edge in affected {
			if state.edges[edge].dyndep != Some(node) {
				continue;
			}
			if self.want_state(edge) == WantState::Nothing {
				continue;
			}
			let inputs = state.edges[edge].inputs.clone();
			for inp in inputs {
				if let Some(producer) = state.nodes[inp].in_edge {
					self.add_edge(state, producer);
				}
			}
			if self.want_state(edge) == WantState::ToStart && self.all_inputs_ready(state, edge) {
				self.schedule(state, edge);
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::graph::{DepsKind, Edge, Mark, PHONY_RULE};
	use raw_string::RawString;

	fn build_edge(outputs: Vec<NodeId>, inputs: Vec<NodeId>) -> Edge {
		Edge {
			rule_name: "cc".to_owned(),
			is_phony: false,
			command: RawString::from("cc -c in -o out"),
			..phony_edge(outputs, inputs)
		}
	}

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

	fn open_logs(name: &str) -> (BuildLogMut, DepLogMut) {
		let build_log_path = std::env::temp_dir().join(format!("ninj-test-plan-{}.log", name));
		let dep_log_path = std::env::temp_dir().join(format!("ninj-test-plan-{}.deps", name));
		std::fs::remove_file(&build_log_path).ok();
		std::fs::remove_file(&dep_log_path).ok();
		(
			BuildLogMut::open(&build_log_path).unwrap(),
			DepLogMut::open(&dep_log_path).unwrap(),
		)
	}

	#[test]
	fn a_chain_of_dirty_edges_becomes_ready_one_at_a_time() {
		let (build_log, mut dep_log) = open_logs("chain");
		let mut state = State::new();
		let a = state.get_node(RawString::from("ninj-test-plan-chain-a.o"), 0);
		let b = state.get_node(RawString::from("b"), 0);
		let edge_a = state.edges.len();
		state.edges.push(build_edge(vec![a], vec![]));
		state.add_out(a, edge_a).unwrap();

		let edge_b = state.edges.len();
		state.edges.push(phony_edge(vec![b], vec![a]));
		state.add_out(b, edge_b).unwrap();
		state.add_in(a, edge_b);

		scan::recompute_dirty(&mut state, &build_log, &mut dep_log, b).unwrap();

		let mut plan = Plan::new();
		plan.add_target(&mut state, b);
		assert!(plan.more_to_do());
		assert_eq!(plan.find_work(), Some(edge_a));
		assert_eq!(plan.find_work(), None);

		plan.edge_finished(&mut state, &mut dep_log, edge_a, EdgeResult::Success)
			.unwrap();
		assert_eq!(plan.find_work(), Some(edge_b));

		plan.edge_finished(&mut state, &mut dep_log, edge_b, EdgeResult::Success)
			.unwrap();
		assert!(!plan.more_to_do());
	}

	#[test]
	fn a_full_pool_delays_a_ready_edge() {
		let (build_log, mut dep_log) = open_logs("pool");
		let mut state = State::new();
		state.pools.push(crate::graph::Pool::new("pool1", 1));

		let a = state.get_node(RawString::from("ninj-test-plan-pool-a.o"), 0);
		let b = state.get_node(RawString::from("ninj-test-plan-pool-b.o"), 0);
		let edge_a = state.edges.len();
		let mut e = build_edge(vec![a], vec![]);
		e.pool = "pool1".to_owned();
		state.edges.push(e);
		state.add_out(a, edge_a).unwrap();

		let edge_b = state.edges.len();
		let mut e = build_edge(vec![b], vec![]);
		e.pool = "pool1".to_owned();
		state.edges.push(e);
		state.add_out(b, edge_b).unwrap();

		scan::recompute_dirty(&mut state, &build_log, &mut dep_log, a).unwrap();
		scan::recompute_dirty(&mut state, &build_log, &mut dep_log, b).unwrap();

		let mut plan = Plan::new();
		plan.add_target(&mut state, a);
		plan.add_target(&mut state, b);

		// Only one of the two edges can run at once: whichever one is
		// still in `ready` was admitted; the other sits in `pool1.delayed`.
		let pool_idx = state.lookup_pool("pool1").unwrap();
		assert_eq!(state.pools[pool_idx].in_flight, 1);
		assert_eq!(state.pools[pool_idx].delayed.len(), 1);

		let first = plan.find_work().unwrap();
		assert_eq!(plan.find_work(), None);

		plan.edge_finished(&mut state, &mut dep_log, first, EdgeResult::Success)
			.unwrap();
		assert_eq!(state.pools[pool_idx].delayed.len(), 0);
		assert!(plan.find_work().is_some());
	}
}
