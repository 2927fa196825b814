//! What the builder reports about build progress, as it happens.
//!
//! The teacher binary's `src/status.rs` renders a live terminal progress
//! bar with an ETA simulation; that's out of scope here (see the crate's
//! top-level docs). The shipped sink is a minimal line-oriented one built
//! on the `log` facade, using the same `debug!(target: ..., ...)` idiom
//! `src/worker.rs` uses elsewhere. A second, recording sink exists purely
//! so tests can assert on the sequence of events a build produced.

use crate::graph::EdgeId;

pub trait Status {
	fn plan_has_total_edges(&mut self, n: usize);
	fn build_started(&mut self);
	fn build_edge_started(&mut self, edge: EdgeId, command: &str, t_ms: u64);
	fn build_edge_finished(&mut self, edge: EdgeId, t_ms: u64, success: bool, output: &[u8]);
	fn build_load_dyndeps(&mut self);
	fn build_finished(&mut self);
	fn error(&mut self, message: &str);
	fn warning(&mut self, message: &str);
}

/// Reports every event through the `log` facade, at `target: "ninj::build"`.
#[derive(Debug, Default)]
pub struct LogStatus {
	total_edges: usize,
	finished_edges: usize,
}

impl LogStatus {
	pub fn new() -> Self {
		LogStatus::default()
	}
}

impl Status for LogStatus {
	fn plan_has_total_edges(&mut self, n: usize) {
		self.total_edges = n;
		self.finished_edges = 0;
	}

	fn build_started(&mut self) {
		log::info!(target: "ninj::build", "starting build of {} edges", self.total_edges);
	}

	fn build_edge_started(&mut self, edge: EdgeId, command: &str, _t_ms: u64) {
		log::debug!(target: "ninj::build", "edge {}: {}", edge, command);
	}

	fn build_edge_finished(&mut self, edge: EdgeId, _t_ms: u64, success: bool, output: &[u8]) {
		self.finished_edges += 1;
		if success {
			log::info!(
				target: "ninj::build",
				"[{}/{}] edge {} finished",
				self.finished_edges,
				self.total_edges,
				edge
			);
		} else {
			log::error!(
				target: "ninj::build",
				"[{}/{}] edge {} failed",
				self.finished_edges,
				self.total_edges,
				edge
			);
		}
		if !output.is_empty() {
			log::info!(target: "ninj::build", "{}", String::from_utf8_lossy(output));
		}
	}

	fn build_load_dyndeps(&mut self) {
		log::debug!(target: "ninj::build", "loading dyndep file");
	}

	fn build_finished(&mut self) {
		log::info!(target: "ninj::build", "build finished");
	}

	fn error(&mut self, message: &str) {
		log::error!(target: "ninj::build", "{}", message);
	}

	fn warning(&mut self, message: &str) {
		log::warn!(target: "ninj::build", "{}", message);
	}
}

/// What happened, for a [`RecordingStatus`] to collect.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
	PlanHasTotalEdges(usize),
	BuildStarted,
	BuildEdgeStarted(EdgeId),
	BuildEdgeFinished(EdgeId, bool),
	BuildLoadDyndeps,
	BuildFinished,
	Error(String),
	Warning(String),
}

/// Appends every event verbatim, for tests to assert on.
#[derive(Debug, Default)]
pub struct RecordingStatus {
	pub events: Vec<Event>,
}

impl RecordingStatus {
	pub fn new() -> Self {
		RecordingStatus::default()
	}
}

impl Status for RecordingStatus {
	fn plan_has_total_edges(&mut self, n: usize) {
		self.events.push(Event::PlanHasTotalEdges(n));
	}
	fn build_started(&mut self) {
		self.events.push(Event::BuildStarted);
	}
	fn build_edge_started(&mut self, edge: EdgeId, _command: &str, _t_ms: u64) {
		self.events.push(Event::BuildEdgeStarted(edge));
	}
	fn build_edge_finished(&mut self, edge: EdgeId, _t_ms: u64, success: bool, _output: &[u8]) {
		self.events.push(Event::BuildEdgeFinished(edge, success));
	}
	fn build_load_dyndeps(&mut self) {
		self.events.push(Event::BuildLoadDyndeps);
	}
	fn build_finished(&mut self) {
		self.events.push(Event::BuildFinished);
	}
	fn error(&mut self, message: &str) {
		self.events.push(Event::Error(message.to_owned()));
	}
	fn warning(&mut self, message: &str) {
		self.events.push(Event::Warning(message.to_owned()));
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn recording_status_captures_events_in_order() {
		let mut status = RecordingStatus::new();
		status.plan_has_total_edges(3);
		status.build_started();
		status.build_edge_started(0, "cc -c a.c", 0);
		status.build_edge_finished(0, 5, true, b"");
		status.build_finished();
		assert_eq!(
			status.events,
			vec![
				Event::PlanHasTotalEdges(3),
				Event::BuildStarted,
				Event::BuildEdgeStarted(0),
				Event::BuildEdgeFinished(0, true),
				Event::BuildFinished,
			]
		);
	}
}
