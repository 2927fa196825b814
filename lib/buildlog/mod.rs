//! Reading and writing build logs (i.e. `.ninja_log` files).
//!
//! The log is a plain text file, one line per `(output, command_hash)`
//! recorded at the end of a run. It's appended to as the build progresses
//! (never rewritten mid-run) and periodically compacted: see
//! [`BuildLogMut::maybe_recompact`].

use crate::mtime::Timestamp;
use raw_string::{RawStr, RawString};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Error, ErrorKind, Write};
use std::path::{Path, PathBuf};

mod murmurhash;

pub use self::murmurhash::murmur_hash_64a;

/// Current log version written by this implementation.
pub const CURRENT_VERSION: u32 = 5;
/// Oldest version this implementation can still read.
pub const MIN_SUPPORTED_VERSION: u32 = 4;

/// Compaction kicks in once there are more than this many total entries...
const COMPACT_MIN_ENTRIES: usize = 100;
/// ...and they outnumber the unique outputs by more than this factor.
const COMPACT_RATIO: usize = 3;

/// The latest entries for all targets in the build log.
#[derive(Clone, Debug)]
pub struct BuildLog {
	pub entries: BTreeMap<RawString, Entry>,
	/// How many lines were read from (or appended to) the file, including
	/// ones later superseded. Drives the compaction heuristic.
	total_entries: usize,
	version: u32,
}

/// An entry in the build log for a specific target.
#[derive(Clone, Debug)]
pub struct Entry {
	pub start_time_ms: u32,
	pub end_time_ms: u32,
	pub restat_mtime: Option<Timestamp>,
	pub command_hash: u64,
}

impl BuildLog {
	/// Create an empty build log.
	pub fn new() -> BuildLog {
		BuildLog {
			entries: BTreeMap::new(),
			total_entries: 0,
			version: CURRENT_VERSION,
		}
	}

	/// Read a build log from a file.
	pub fn read(file: impl AsRef<Path>) -> Result<BuildLog, Error> {
		let file = File::open(file.as_ref()).map_err(|e| {
			Error::new(
				e.kind(),
				format!("Unable to read {:?}: {}", file.as_ref(), e),
			)
		})?;
		BuildLog::read_from(file)
	}

	/// Read a log, tolerating a truncated trailing line.
	pub fn read_from(file: File) -> Result<BuildLog, Error> {
		let mut file = BufReader::new(file);

		let mut line = RawString::new();
		file.read_until(b'\n', &mut line.as_mut_bytes())?;

		if !line.starts_with("# ninja log v") {
			return Err(Error::new(ErrorKind::InvalidData, "Not a ninja log file"));
		}
		if line.last() == Some(b'\n') {
			line.pop();
		}

		let version: u32 = parse(&line[13..])
			.ok_or_else(|| Error::new(ErrorKind::InvalidData, "Version is not an integer"))?;

		if version < MIN_SUPPORTED_VERSION || version > CURRENT_VERSION {
			return Err(Error::new(
				ErrorKind::InvalidData,
				format!(
					"Unsupported version {} (only {}..={} are supported)",
					version, MIN_SUPPORTED_VERSION, CURRENT_VERSION
				),
			));
		}

		let not_an_integer = || Error::new(ErrorKind::InvalidData, "Field is not an integer");
		let not_hex = || Error::new(ErrorKind::InvalidData, "Invalid command hash");

		let mut entries = BTreeMap::new();
		let mut total_entries = 0;

		loop {
			line.clear();
			if file.read_until(b'\n', &mut line.as_mut_bytes())? == 0 {
				break;
			}
			if line.last() != Some(b'\n') {
				// Truncated trailing line: tolerate it silently.
				break;
			}
			line.pop();

			let mut tabs = memchr::memchr_iter(b'\t', line.as_bytes());
			let (tab1, tab2, tab3, tab4) = match (tabs.next(), tabs.next(), tabs.next(), tabs.next())
			{
				(Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
				// A malformed line is treated the same as a truncated tail.
				_ => break,
			};

			let key: RawString = line[tab3 + 1..tab4].into();
			let value = Entry {
				start_time_ms: match parse(&line[0..tab1]) {
					Some(v) => v,
					None => return Err(not_an_integer()),
				},
				end_time_ms: match parse(&line[tab1 + 1..tab2]) {
					Some(v) => v,
					None => return Err(not_an_integer()),
				},
				restat_mtime: Timestamp::from_nanos(
					parse(&line[tab2 + 1..tab3]).ok_or_else(not_an_integer)?,
				),
				command_hash: if version < 5 {
					murmur_hash_64a(line[tab4 + 1..].as_bytes())
				} else {
					parse_hex(&line[tab4 + 1..]).ok_or_else(not_hex)?
				},
			};

			total_entries += 1;
			entries.insert(key, value);
		}

		Ok(BuildLog {
			entries,
			total_entries,
			version,
		})
	}

	fn write_to(&self, file: &File) -> Result<(), Error> {
		let mut file = BufWriter::new(file);
		file.write_all(format!("# ninja log v{}\n", CURRENT_VERSION).as_bytes())?;
		for (output, entry) in &self.entries {
			write_entry(&mut file, output, entry)?;
		}
		file.flush()
	}

	fn needs_recompaction(&self) -> bool {
		self.version < CURRENT_VERSION
			|| (self.total_entries > COMPACT_MIN_ENTRIES
				&& self.total_entries > COMPACT_RATIO * self.entries.len())
	}
}

fn write_entry(mut w: impl Write, output: &RawStr, entry: &Entry) -> Result<(), Error> {
	writeln!(
		w,
		"{}\t{}\t{}\t{}\t{:x}",
		entry.start_time_ms,
		entry.end_time_ms,
		entry.restat_mtime.map_or(0, Timestamp::to_nanos),
		output,
		entry.command_hash
	)
}

fn parse<T: std::str::FromStr>(s: &RawStr) -> Option<T> {
	s.to_str().ok().and_then(|s| s.parse().ok())
}

fn parse_hex(s: &RawStr) -> Option<u64> {
	s.to_str()
		.ok()
		.and_then(|s| u64::from_str_radix(s, 16).ok())
}

/// A build log open for appending, as used during a build.
#[derive(Debug)]
pub struct BuildLogMut {
	log: BuildLog,
	path: PathBuf,
	file: BufWriter<File>,
}

impl BuildLogMut {
	/// Open (or create) the log at `path`, recompacting immediately if
	/// needed (e.g. because it was written by an older version).
	pub fn open(path: impl Into<PathBuf>) -> Result<BuildLogMut, Error> {
		let path = path.into();
		let log = match File::open(&path) {
			Ok(f) => BuildLog::read_from(f)?,
			Err(ref e) if e.kind() == ErrorKind::NotFound => BuildLog::new(),
			Err(e) => return Err(e),
		};
		let file = std::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)?;
		let mut log_mut = BuildLogMut {
			log,
			path,
			file: BufWriter::new(file),
		};
		if log_mut.log.total_entries == 0 {
			log_mut.file.write_all(format!("# ninja log v{}\n", CURRENT_VERSION).as_bytes())?;
		}
		if log_mut.log.needs_recompaction() {
			log_mut.recompact()?;
		}
		Ok(log_mut)
	}

	pub fn get(&self, output: &RawStr) -> Option<&Entry> {
		self.log.entries.get(output)
	}

	/// Append one entry per output, as ninja does at the end of a
	/// successful (or failed-but-run) command.
	pub fn record<'a>(
		&mut self,
		outputs: impl IntoIterator<Item = &'a RawStr>,
		start_time_ms: u32,
		end_time_ms: u32,
		restat_mtime: Option<Timestamp>,
		command_hash: u64,
	) -> Result<(), Error> {
		for output in outputs {
			let entry = Entry {
				start_time_ms,
				end_time_ms,
				restat_mtime,
				command_hash,
			};
			write_entry(&mut self.file, output, &entry)?;
			self.log.total_entries += 1;
			self.log.entries.insert(output.to_owned(), entry);
		}
		self.file.flush()?;
		if self.log.needs_recompaction() {
			self.recompact()?;
		}
		Ok(())
	}

	/// Re-stat the given outputs (or all outputs, if empty) and rewrite the
	/// log with updated `restat_mtime`s.
	pub fn restat(&mut self, outputs: &[RawString]) -> Result<(), Error> {
		let targets: Vec<RawString> = if outputs.is_empty() {
			self.log.entries.keys().cloned().collect()
		} else {
			outputs.to_vec()
		};
		for target in targets {
			if let Some(entry) = self.log.entries.get_mut(&target) {
				let path = target.to_path().ok();
				entry.restat_mtime = path.and_then(|p| crate::mtime::mtime(p).ok().flatten());
			}
		}
		self.recompact()
	}

	/// Rewrite the log to `path.tmp`, then rename it over `path`, dropping
	/// superseded entries and resetting the total-entry counter.
	pub fn recompact(&mut self) -> Result<(), Error> {
		let tmp_path = self.path.with_extension("tmp");
		let tmp_file = File::create(&tmp_path)?;
		self.log.write_to(&tmp_file)?;
		drop(tmp_file);
		std::fs::rename(&tmp_path, &self.path)?;
		self.log.total_entries = self.log.entries.len();
		self.log.version = CURRENT_VERSION;
		self.file = BufWriter::new(
			std::fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(&self.path)?,
		);
		Ok(())
	}
}

impl std::ops::Deref for BuildLogMut {
	type Target = BuildLog;
	fn deref(&self) -> &Self::Target {
		&self.log
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn round_trips_a_single_entry() -> Result<(), Error> {
		let path = std::env::temp_dir().join("ninj-test-build-log-round-trip");
		std::fs::remove_file(&path).ok();
		{
			let mut log = BuildLogMut::open(&path)?;
			log.record(
				vec![RawStr::from_str("out")],
				0,
				10,
				None,
				murmur_hash_64a(b"cat in > out"),
			)?;
		}
		{
			let log = BuildLog::read(&path)?;
			let entry = log.entries.get(RawStr::from_str("out")).unwrap();
			assert_eq!(entry.command_hash, murmur_hash_64a(b"cat in > out"));
		}
		std::fs::remove_file(&path)?;
		Ok(())
	}

	#[test]
	fn recompaction_drops_superseded_entries() -> Result<(), Error> {
		let path = std::env::temp_dir().join("ninj-test-build-log-recompact");
		std::fs::remove_file(&path).ok();
		{
			let mut log = BuildLogMut::open(&path)?;
			for i in 0..150 {
				log.record(vec![RawStr::from_str("out")], i, i + 1, None, i as u64)?;
			}
			assert!(log.log.total_entries <= COMPACT_RATIO * log.log.entries.len().max(1));
		}
		std::fs::remove_file(&path)?;
		Ok(())
	}
}
