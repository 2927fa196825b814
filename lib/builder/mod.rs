//! Driving [`Plan`] and [`Runner`] together: admitting ready edges,
//! reaping finished commands, and doing the bookkeeping (build log, deps
//! log, restat, rspfile/depfile cleanup) that follows each one.

use crate::buildlog::BuildLogMut;
use crate::clparser::CLParser;
use crate::depfile::read_deps_file;
use crate::deplog::DepLogMut;
use crate::fs::FileSystem;
use crate::graph::{DepsKind, EdgeId, NodeId, State, CONSOLE_POOL};
use crate::plan::{EdgeResult, Plan};
use crate::runner::{CommandResult, Runner};
use crate::scan::{self, ScanError};
use crate::status::Status;
use raw_string::{RawStr, RawString};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub enum BuildError {
	Io(io::Error),
	Scan(ScanError),
	/// The build was interrupted (SIGINT/SIGTERM/SIGHUP on a command).
	Interrupted,
	/// `FailuresAllowed` reached zero: no more work is being admitted.
	Failed,
	/// Nothing is in flight, nothing was admitted, but the plan still
	/// wants more edges built. Always a bug (a cycle should have been
	/// caught by `scan` before the build ever started).
	Stuck,
}

impl fmt::Display for BuildError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			BuildError::Io(e) => write!(f, "{}", e),
			BuildError::Scan(e) => write!(f, "{}", e),
			BuildError::Interrupted => write!(f, "interrupted"),
			BuildError::Failed => write!(f, "subcommand(s) failed"),
			BuildError::Stuck => write!(f, "stuck [this is a bug]"),
		}
	}
}

impl StdError for BuildError {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		match self {
			BuildError::Io(e) => Some(e),
			BuildError::Scan(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for BuildError {
	fn from(e: io::Error) -> Self {
		BuildError::Io(e)
	}
}
impl From<ScanError> for BuildError {
	fn from(e: ScanError) -> Self {
		BuildError::Scan(e)
	}
}

fn to_path(raw: &RawString) -> Result<PathBuf, BuildError> {
	raw.to_path()
		.map_err(|_| BuildError::Io(io::Error::new(io::ErrorKind::InvalidData, "path is not valid UTF-8")))
}

/// Runs a build: admits ready edges up to the parallelism limit, reaps
/// finished commands, and stops once the plan has nothing left to do (or
/// `FailuresAllowed` is exhausted).
pub struct Builder<'a> {
	state: &'a mut State,
	build_log: &'a mut BuildLogMut,
	dep_log: &'a mut DepLogMut,
	fs: &'a dyn FileSystem,
	status: &'a mut dyn Status,
	plan: Plan,
	runner: Runner,
	failures_allowed: u32,
	keep_rsp: bool,
	keep_depfile: bool,
	start_time: Instant,
	/// Milliseconds since `start_time` at which each in-flight edge started,
	/// for the `start_time_ms`/`end_time_ms` pair the build log records.
	edge_start_times: HashMap<EdgeId, u64>,
	/// Set by a signal handler the caller installs; checked once per main
	/// loop iteration so a `SIGINT` during a blocking `Runner::wait` still
	/// runs [`Builder::cleanup`] instead of leaving partial outputs.
	interrupted: Option<&'a AtomicBool>,
}

impl<'a> Builder<'a> {
	pub fn new(
		state: &'a mut State,
		build_log: &'a mut BuildLogMut,
		dep_log: &'a mut DepLogMut,
		fs: &'a dyn FileSystem,
		status: &'a mut dyn Status,
		parallelism: u32,
		failures_allowed: u32,
	) -> Self {
		Builder {
			state,
			build_log,
			dep_log,
			fs,
			status,
			plan: Plan::new(),
			runner: Runner::new(parallelism),
			failures_allowed: failures_allowed.max(1),
			keep_rsp: false,
			keep_depfile: false,
			start_time: Instant::now(),
			edge_start_times: HashMap::new(),
			interrupted: None,
		}
	}

	/// Keep the rspfile around after the command that used it finishes
	/// (`-d keeprsp`).
	pub fn keep_rsp(mut self, keep: bool) -> Self {
		self.keep_rsp = keep;
		self
	}

	/// Keep the depfile around after it's been read (`-d keepdepfile`).
	pub fn keep_depfile(mut self, keep: bool) -> Self {
		self.keep_depfile = keep;
		self
	}

	/// A flag a signal handler sets to ask the build to stop and clean up.
	pub fn interrupt_flag(mut self, flag: &'a AtomicBool) -> Self {
		self.interrupted = Some(flag);
		self
	}

	/// Scan `targets` for dirtiness, plan everything they (transitively)
	/// need, and run it to completion.
	pub fn build(&mut self, targets: &[NodeId]) -> Result<(), BuildError> {
		let mut validations = Vec::new();
		for &target in targets {
			validations.extend(scan::recompute_dirty(self.state, self.build_log, self.dep_log, target)?);
		}
		for &target in targets {
			self.plan.add_target(self.state, target);
		}
		if !validations.is_empty() {
			self.status.build_load_dyndeps();
			for v in validations {
				self.plan.add_target(self.state, v);
			}
		}

		self.status.plan_has_total_edges(self.plan.edge_count());
		self.status.build_started();

		while self.plan.more_to_do() {
			let mut admitted = false;
			while self.failures_allowed > 0 && self.runner.can_run_more() {
				match self.plan.find_work() {
					Some(edge) => {
						self.start_edge(edge)?;
						admitted = true;
					}
					None => break,
				}
			}

			let mut reaped = false;
			if self.runner.in_flight() > 0 {
				if let Some(finished) = self.runner.wait()? {
					self.finish_command(finished)?;
					reaped = true;
				}
			}

			if self.interrupted.map_or(false, |f| f.load(Ordering::SeqCst)) {
				self.cleanup();
				return Err(BuildError::Interrupted);
			}

			if !admitted && !reaped {
				break;
			}
		}

		self.status.build_finished();

		if self.failures_allowed == 0 {
			Err(BuildError::Failed)
		} else if self.plan.more_to_do() {
			Err(BuildError::Stuck)
		} else {
			Ok(())
		}
	}

	/// Kill whatever's still running and remove outputs a command may
	/// have partly written. Called after an interrupt.
	pub fn cleanup(&mut self) {
		let edges = self.runner.in_flight_edges();
		self.runner.kill_all();
		for edge in edges {
			let outputs = self.state.edges[edge].outputs.clone();
			let depfile = self.state.edges[edge].depfile.clone();
			let has_depfile = !depfile.is_empty();
			for &out in &outputs {
				let path = match to_path(&self.state.nodes[out].path) {
					Ok(p) => p,
					Err(_) => continue,
				};
				let remove = if has_depfile {
					true
				} else {
					let previous = self.state.nodes[out].mtime;
					self.fs.stat(&path).ok().flatten() != previous
				};
				if remove {
					let _ = self.fs.remove_file(&path);
				}
			}
			if has_depfile {
				if let Ok(path) = to_path(&depfile) {
					let _ = self.fs.remove_file(&path);
				}
			}
		}
	}

	fn start_edge(&mut self, edge: EdgeId) -> Result<(), BuildError> {
		if self.state.edges[edge].is_phony {
			return self.finish_phony(edge);
		}

		let outputs = self.state.edges[edge].outputs.clone();
		for &out in &outputs {
			let path = to_path(&self.state.nodes[out].path)?;
			self.fs.make_dirs(&path)?;
		}

		if !self.state.edges[edge].rspfile.is_empty() {
			let rspfile = to_path(&self.state.edges[edge].rspfile.clone())?;
			let content = self.state.edges[edge].rspfile_content.clone();
			self.fs.write_file(&rspfile, content.as_bytes())?;
		}

		let console_pool = self.state.lookup_pool(CONSOLE_POOL);
		let use_console = self.state.pool_for_edge(&self.state.edges[edge]) == console_pool;

		let command = self.state.edges[edge].command.clone();
		let description = &self.state.edges[edge].description;
		let description = if description.is_empty() { &command } else { description };
		let t_ms = self.start_time.elapsed().as_millis() as u64;
		self.status
			.build_edge_started(edge, &String::from_utf8_lossy(description.as_bytes()), t_ms);

		self.runner.start(edge, &command, use_console)?;
		self.edge_start_times.insert(edge, t_ms);
		Ok(())
	}

	fn finish_phony(&mut self, edge: EdgeId) -> Result<(), BuildError> {
		let t_ms = self.start_time.elapsed().as_millis() as u64;
		self.status.build_edge_started(edge, "", t_ms);
		self.status.build_edge_finished(edge, t_ms, true, &[]);
		self.plan
			.edge_finished(self.state, self.dep_log, edge, EdgeResult::Success)?;
		Ok(())
	}

	fn finish_command(&mut self, finished: crate::runner::FinishedCommand) -> Result<(), BuildError> {
		let edge = finished.edge;
		let start_ms = self.edge_start_times.remove(&edge).unwrap_or(0);
		let end_ms = self.start_time.elapsed().as_millis() as u64;
		let mut output = finished.output;

		if finished.result == CommandResult::Interrupted {
			self.status.build_edge_finished(edge, end_ms, false, &output);
			self.plan
				.edge_finished(self.state, self.dep_log, edge, EdgeResult::Failure)?;
			return Err(BuildError::Interrupted);
		}

		let mut success = finished.result == CommandResult::Success;
		let mut discovered: Option<Vec<RawString>> = None;

		if success {
			match self.state.edges[edge].deps {
				DepsKind::Msvc => {
					let prefix = self.state.edges[edge].msvc_deps_prefix.clone();
					let mut parser = CLParser::new(prefix);
					let filtered = parser.filter(RawStr::from_bytes(&output));
					output = filtered.as_bytes().to_vec();
					discovered = Some(parser.includes().map(|s| s.to_owned()).collect());
				}
				DepsKind::Gcc => {
					let depfile = self.state.edges[edge].depfile.clone();
					if !depfile.is_empty() {
						match to_path(&depfile).and_then(|path| read_deps_file_deps(&path)) {
							Ok(deps) => discovered = Some(deps),
							Err(_) => success = false,
						}
					}
				}
				DepsKind::None => {}
			}
		}

		self.status.build_edge_finished(edge, end_ms, success, &output);

		if !success {
			self.status.error(&format!("edge {} failed", edge));
			self.plan
				.edge_finished(self.state, self.dep_log, edge, EdgeResult::Failure)?;
			self.failures_allowed = self.failures_allowed.saturating_sub(1);
			return Ok(());
		}

		let outputs = self.state.edges[edge].outputs.clone();
		for &out in &outputs {
			let path = to_path(&self.state.nodes[out].path)?;
			self.state.nodes[out].mtime = self.fs.stat(&path)?;
			self.state.nodes[out].statted = true;
		}

		let restat_clean = self.state.edges[edge].restat
			&& outputs.first().map_or(false, |&out| {
				let current = self.state.nodes[out].mtime;
				self.build_log
					.get(&self.state.nodes[out].path)
					.map_or(false, |entry| entry.restat_mtime == current)
			});

		let mut recorded_mtime = self.state.edges[edge]
			.dirty_relevant_inputs()
			.iter()
			.filter_map(|&inp| self.state.nodes[inp].mtime)
			.max();
		let depfile = self.state.edges[edge].depfile.clone();
		if !depfile.is_empty() {
			if let Ok(path) = to_path(&depfile) {
				if let Ok(Some(depfile_mtime)) = self.fs.stat(&path) {
					recorded_mtime = Some(recorded_mtime.map_or(depfile_mtime, |m| m.max(depfile_mtime)));
				}
			}
		}

		if restat_clean {
			for &out in &outputs {
				self.plan.clean_node(self.state, self.build_log, out);
			}
		}

		self.plan
			.edge_finished(self.state, self.dep_log, edge, EdgeResult::Success)?;

		let command_hash = self.state.edges[edge].hash();
		let out_paths: Vec<RawString> = outputs.iter().map(|&o| self.state.nodes[o].path.clone()).collect();
		let out_refs: Vec<&RawStr> = out_paths.iter().map(|p| &p[..]).collect();
		self.build_log
			.record(out_refs, start_ms as u32, end_ms as u32, recorded_mtime, command_hash)?;

		if let Some(deps) = discovered {
			for &out in &outputs {
				let out_path = self.state.nodes[out].path.clone();
				self.dep_log.insert_deps(out_path, recorded_mtime, deps.clone())?;
			}
		}

		if !self.keep_rsp && !self.state.edges[edge].rspfile.is_empty() {
			let path = to_path(&self.state.edges[edge].rspfile.clone())?;
			self.fs.remove_file(&path)?;
		}
		if !self.keep_depfile && !depfile.is_empty() {
			let path = to_path(&depfile)?;
			self.fs.remove_file(&path)?;
		}

		Ok(())
	}
}

fn read_deps_file_deps(path: &Path) -> io::Result<Vec<RawString>> {
	let mut deps = Vec::new();
	read_deps_file(path, |_target, mut d| {
		deps.append(&mut d);
		Ok(())
	})?;
	Ok(deps)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::fs::RealFileSystem;
	use crate::graph::{Edge, Mark, PHONY_RULE};
	use crate::status::RecordingStatus;

	fn build_edge(outputs: Vec<NodeId>, inputs: Vec<NodeId>, command: &str) -> Edge {
		Edge {
			rule_name: "touch".to_owned(),
			is_phony: false,
			inputs,
			implicit_deps: 0,
			order_only_deps: 0,
			outputs,
			implicit_outs: 0,
			validations: Vec::new(),
			command: RawString::from(command),
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
		let build_log_path = std::env::temp_dir().join(format!("ninj-test-builder-{}.log", name));
		let dep_log_path = std::env::temp_dir().join(format!("ninj-test-builder-{}.deps", name));
		std::fs::remove_file(&build_log_path).ok();
		std::fs::remove_file(&dep_log_path).ok();
		(
			BuildLogMut::open(&build_log_path).unwrap(),
			DepLogMut::open(&dep_log_path).unwrap(),
		)
	}

	#[test]
	fn building_a_missing_output_runs_its_command() {
		let out_path = std::env::temp_dir().join("ninj-test-builder-out.txt");
		std::fs::remove_file(&out_path).ok();

		let (mut build_log, mut dep_log) = open_logs("missing-output");
		let mut state = State::new();
		let out = state.get_node(RawString::from(out_path.to_str().unwrap()), 0);
		let edge = state.edges.len();
		state
			.edges
			.push(build_edge(vec![out], vec![], &format!("touch {}", out_path.display())));
		state.add_out(out, edge).unwrap();

		let fs = RealFileSystem;
		let mut status = RecordingStatus::new();
		let mut builder = Builder::new(&mut state, &mut build_log, &mut dep_log, &fs, &mut status, 1, 1);
		builder.build(&[out]).unwrap();

		assert!(out_path.is_file());
		assert!(status.events.contains(&crate::status::Event::BuildEdgeFinished(edge, true)));
		std::fs::remove_file(&out_path).ok();
	}

	#[test]
	fn rebuilding_with_an_unchanged_command_and_output_is_a_no_op() {
		let out_path = std::env::temp_dir().join("ninj-test-builder-rebuild.txt");
		std::fs::remove_file(&out_path).ok();

		let (mut build_log, mut dep_log) = open_logs("rebuild-noop");
		let command = format!("touch {}", out_path.display());

		{
			let mut state = State::new();
			let out = state.get_node(RawString::from(out_path.to_str().unwrap()), 0);
			let edge = state.edges.len();
			state.edges.push(build_edge(vec![out], vec![], &command));
			state.add_out(out, edge).unwrap();

			let fs = RealFileSystem;
			let mut status = RecordingStatus::new();
			let mut builder = Builder::new(&mut state, &mut build_log, &mut dep_log, &fs, &mut status, 1, 1);
			builder.build(&[out]).unwrap();
			assert!(status.events.contains(&crate::status::Event::BuildEdgeStarted(edge)));
		}

		// Same manifest, same build log: the edge's recorded command hash
		// still matches and its output hasn't changed since, so `scan`
		// should find it clean and `builder` should never start it again.
		{
			let mut state = State::new();
			let out = state.get_node(RawString::from(out_path.to_str().unwrap()), 0);
			let edge = state.edges.len();
			state.edges.push(build_edge(vec![out], vec![], &command));
			state.add_out(out, edge).unwrap();

			let fs = RealFileSystem;
			let mut status = RecordingStatus::new();
			let mut builder = Builder::new(&mut state, &mut build_log, &mut dep_log, &fs, &mut status, 1, 1);
			builder.build(&[out]).unwrap();
			assert!(!status.events.iter().any(|e| matches!(e, crate::status::Event::BuildEdgeStarted(_))));
		}

		std::fs::remove_file(&out_path).ok();
	}

	#[test]
	fn a_failing_command_is_reported_and_stops_the_build() {
		let (mut build_log, mut dep_log) = open_logs("failing-command");
		let mut state = State::new();
		let out = state.get_node(RawString::from("ninj-test-builder-never.txt"), 0);
		let edge = state.edges.len();
		state.edges.push(build_edge(vec![out], vec![], "exit 1"));
		state.add_out(out, edge).unwrap();

		let fs = RealFileSystem;
		let mut status = RecordingStatus::new();
		let mut builder = Builder::new(&mut state, &mut build_log, &mut dep_log, &fs, &mut status, 1, 1);
		let err = builder.build(&[out]).unwrap_err();

		assert!(matches!(err, BuildError::Failed));
		assert!(status.events.contains(&crate::status::Event::BuildEdgeFinished(edge, false)));
	}

	#[test]
	fn phony_edges_finish_without_running_a_command() {
		let (mut build_log, mut dep_log) = open_logs("phony");
		let mut state = State::new();
		let out = state.get_node(RawString::from("ninj-test-builder-phony"), 0);
		let edge = state.edges.len();
		state.edges.push(Edge {
			rule_name: PHONY_RULE.to_owned(),
			is_phony: true,
			..build_edge(vec![out], vec![], "")
		});
		state.add_out(out, edge).unwrap();

		let fs = RealFileSystem;
		let mut status = RecordingStatus::new();
		let mut builder = Builder::new(&mut state, &mut build_log, &mut dep_log, &fs, &mut status, 1, 1);
		builder.build(&[out]).unwrap();

		assert!(status.events.contains(&crate::status::Event::BuildEdgeFinished(edge, true)));
	}
}
