//! Spawning and reaping the subprocesses [`crate::builder`] admits.
//!
//! Grounded on the teacher's `src/worker/subprocess.rs`, which multiplexes
//! one child's stdout/stderr with `nix::poll` while it waits for that one
//! child to exit. The concurrency model here is a single cooperative loop
//! rather than a worker thread per job, so [`Runner::wait`] generalizes
//! that to multiplex *every* in-flight child (and both its pipes) in one
//! `poll()` call, returning as soon as any one of them exits.

use crate::graph::EdgeId;
use nix::poll::{poll, EventFlags, PollFd};
use raw_string::unix::RawStrExt;
use raw_string::RawStr;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Stdio};

/// How a finished command should be treated by the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
	Success,
	Failure,
	/// Terminated by SIGINT/SIGTERM/SIGHUP: distinct from an ordinary
	/// failure so the builder can skip recording it to the logs.
	Interrupted,
}

/// A command that just finished, with its combined stdout+stderr.
pub struct FinishedCommand {
	pub edge: EdgeId,
	pub result: CommandResult,
	pub output: Vec<u8>,
}

struct Handle {
	edge: EdgeId,
	child: Child,
	stdout: Option<File>,
	stderr: Option<File>,
	output: Vec<u8>,
}

/// Spawns shell-interpreted commands and multiplexes their completion.
///
/// At most `parallelism` commands run at once. Throttling further on load
/// average is left to whatever calls [`Runner::can_run_more`]: measuring
/// the load average itself is out of scope for this crate.
pub struct Runner {
	parallelism: u32,
	handles: Vec<Handle>,
}

impl Runner {
	pub fn new(parallelism: u32) -> Self {
		Runner {
			parallelism: parallelism.max(1),
			handles: Vec::new(),
		}
	}

	pub fn in_flight(&self) -> usize {
		self.handles.len()
	}

	/// The edges currently running, for [`crate::builder`]'s cleanup after
	/// an interrupt.
	pub fn in_flight_edges(&self) -> Vec<EdgeId> {
		self.handles.iter().map(|h| h.edge).collect()
	}

	pub fn can_run_more(&self) -> bool {
		self.handles.len() < self.parallelism as usize
	}

	/// Start `command` under `sh -c`. `use_console` lets the child inherit
	/// this process's stdout/stderr directly instead of having them
	/// captured; callers only do this for the edge holding the console
	/// pool, which serializes access to it (depth 1).
	pub fn start(&mut self, edge: EdgeId, command: &RawStr, use_console: bool) -> io::Result<()> {
		let mut cmd = Command::new("sh");
		cmd.arg("-c").arg(command.as_osstr()).stdin(Stdio::null());
		if use_console {
			cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
		} else {
			cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
		}
		let mut child = cmd.spawn()?;
		let stdout = if use_console {
			None
		} else {
			child.stdout.take().map(|f| unsafe { into_file(f) })
		};
		let stderr = if use_console {
			None
		} else {
			child.stderr.take().map(|f| unsafe { into_file(f) })
		};
		self.handles.push(Handle {
			edge,
			child,
			stdout,
			stderr,
			output: Vec::new(),
		});
		Ok(())
	}

	/// Block until one in-flight command finishes. Returns `None` if
	/// nothing is in flight.
	pub fn wait(&mut self) -> io::Result<Option<FinishedCommand>> {
		if self.handles.is_empty() {
			return Ok(None);
		}
		loop {
			// A child whose pipes are both closed may already have
			// exited; `try_wait` is non-blocking so this never stalls.
			for i in 0..self.handles.len() {
				if self.handles[i].stdout.is_none() && self.handles[i].stderr.is_none() {
					if let Some(status) = self.handles[i].child.try_wait()? {
						return Ok(Some(self.finish(i, status)));
					}
				}
			}

			let (mut fds, mapping) = self.poll_targets();
			if fds.is_empty() {
				// Every open pipe has closed (or this child never had
				// any, i.e. it ran on the console); the only thing left
				// to do is block on its exit directly.
				let status = self.handles[0].child.wait()?;
				return Ok(Some(self.finish(0, status)));
			}

			let n = poll(&mut fds, -1).map_err(|e| e.as_errno().unwrap())?;
			if n == 0 {
				continue;
			}
			for (poll_idx, &(handle_idx, is_stdout)) in mapping.iter().enumerate() {
				let revents = match fds[poll_idx].revents() {
					Some(r) => r,
					None => continue,
				};
				if revents.contains(EventFlags::POLLIN) {
					self.read_into(handle_idx, is_stdout)?;
				}
				if revents.intersects(EventFlags::POLLERR | EventFlags::POLLHUP) {
					self.close_pipe(handle_idx, is_stdout);
				}
			}
		}
	}

	/// Kill every in-flight child. Does not wait for them to exit.
	pub fn kill_all(&mut self) {
		for h in &mut self.handles {
			let _ = h.child.kill();
		}
	}

	fn poll_targets(&self) -> (Vec<PollFd>, Vec<(usize, bool)>) {
		let mut fds = Vec::new();
		let mut mapping = Vec::new();
		for (i, h) in self.handles.iter().enumerate() {
			if let Some(out) = &h.stdout {
				fds.push(PollFd::new(out.as_raw_fd(), EventFlags::POLLIN));
				mapping.push((i, true));
			}
			if let Some(err) = &h.stderr {
				fds.push(PollFd::new(err.as_raw_fd(), EventFlags::POLLIN));
				mapping.push((i, false));
			}
		}
		(fds, mapping)
	}

	fn read_into(&mut self, handle_idx: usize, is_stdout: bool) -> io::Result<()> {
		let h = &mut self.handles[handle_idx];
		let file = if is_stdout { h.stdout.as_mut() } else { h.stderr.as_mut() };
		let file = match file {
			Some(f) => f,
			None => return Ok(()),
		};
		let mut buf = [0u8; 4 * 1024];
		match file.read(&mut buf) {
			Ok(0) => self.close_pipe(handle_idx, is_stdout),
			Ok(n) => h.output.extend_from_slice(&buf[..n]),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
			Err(e) => return Err(e),
		}
		Ok(())
	}

	fn close_pipe(&mut self, handle_idx: usize, is_stdout: bool) {
		let h = &mut self.handles[handle_idx];
		if is_stdout {
			h.stdout = None;
		} else {
			h.stderr = None;
		}
	}

	fn finish(&mut self, idx: usize, status: ExitStatus) -> FinishedCommand {
		let h = self.handles.remove(idx);
		let result = if status.success() {
			CommandResult::Success
		} else {
			match status.signal() {
				// SIGHUP, SIGINT, SIGTERM.
				Some(1) | Some(2) | Some(15) => CommandResult::Interrupted,
				_ => CommandResult::Failure,
			}
		};
		FinishedCommand {
			edge: h.edge,
			result,
			output: h.output,
		}
	}
}

unsafe fn into_file(stream: impl IntoRawFd) -> File {
	File::from_raw_fd(stream.into_raw_fd())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn runs_a_command_and_captures_its_output() {
		let mut runner = Runner::new(2);
		runner.start(0, RawStr::from_str("echo hello"), false).unwrap();
		let finished = runner.wait().unwrap().unwrap();
		assert_eq!(finished.edge, 0);
		assert_eq!(finished.result, CommandResult::Success);
		assert_eq!(finished.output, b"hello\n");
	}

	#[test]
	fn a_failing_command_is_reported_as_a_failure() {
		let mut runner = Runner::new(1);
		runner.start(1, RawStr::from_str("exit 1"), false).unwrap();
		let finished = runner.wait().unwrap().unwrap();
		assert_eq!(finished.result, CommandResult::Failure);
	}

	#[test]
	fn multiple_in_flight_commands_are_all_reaped() {
		let mut runner = Runner::new(4);
		runner.start(0, RawStr::from_str("echo a"), false).unwrap();
		runner.start(1, RawStr::from_str("echo b"), false).unwrap();
		let mut seen = Vec::new();
		seen.push(runner.wait().unwrap().unwrap().edge);
		seen.push(runner.wait().unwrap().unwrap().edge);
		seen.sort();
		assert_eq!(seen, vec![0, 1]);
		assert!(runner.wait().unwrap().is_none());
	}
}
