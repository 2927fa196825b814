use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};

use ninj::builder::{BuildError, Builder};
use ninj::buildlog::BuildLogMut;
use ninj::deplog::DepLogMut;
use ninj::fs::RealFileSystem;
use ninj::graph::{NodeId, State};
use ninj::status::LogStatus;
use raw_string::RawString;
use structopt::StructOpt;

mod logger;

/// A small, `ninja`-compatible build tool.
#[derive(StructOpt)]
#[structopt(name = "ninj")]
struct Opt {
	/// The input build file.
	#[structopt(short = "f", default_value = "build.ninja")]
	file: PathBuf,

	/// Run N commands in parallel (defaults to the number of CPUs).
	#[structopt(short = "j")]
	parallelism: Option<u32>,

	/// Keep going until N commands fail (0 means no limit).
	#[structopt(short = "k", default_value = "1")]
	failures_allowed: u32,

	/// Explain why each target is (or isn't) rebuilt.
	#[structopt(short = "v")]
	verbose: bool,

	/// Targets to build. Defaults to the manifest's own defaults.
	targets: Vec<String>,
}

fn main() {
	let opt = Opt::from_args();
	log::set_max_level(if opt.verbose {
		log::LevelFilter::Debug
	} else {
		log::LevelFilter::Info
	});
	log::set_logger(&logger::LOGGER).ok();
	exit(run(&opt));
}

fn resolve_target(state: &State, arg: &str) -> Option<NodeId> {
	let (canon, _bits) = ninj::path::canonicalize(arg).ok()?;
	state.lookup_node(&RawString::from(canon))
}

fn run(opt: &Opt) -> i32 {
	let mut state = match ninj::spec::read(&opt.file) {
		Ok(state) => state,
		Err(error) => {
			eprintln!("{}", error);
			return 2;
		}
	};

	let targets: Vec<NodeId> = if opt.targets.is_empty() {
		state.default_targets.clone()
	} else {
		let mut resolved = Vec::with_capacity(opt.targets.len());
		for arg in &opt.targets {
			match resolve_target(&state, arg) {
				Some(node) => resolved.push(node),
				None => {
					eprintln!("ninj: unknown target {:?}", arg);
					return 2;
				}
			}
		}
		resolved
	};
	if targets.is_empty() {
		eprintln!("ninj: no targets given and no default target in {:?}", opt.file);
		return 2;
	}

	let build_dir = match &state.build_dir {
		Some(dir) => dir.to_path().unwrap_or_default(),
		None => PathBuf::new(),
	};

	let mut build_log = match BuildLogMut::open(build_dir.join(".ninja_log")) {
		Ok(log) => log,
		Err(error) => {
			eprintln!("ninj: {}", error);
			return 2;
		}
	};
	let mut dep_log = match DepLogMut::open(build_dir.join(".ninja_deps")) {
		Ok(log) => log,
		Err(error) => {
			eprintln!("ninj: {}", error);
			return 2;
		}
	};

	let parallelism = opt.parallelism.unwrap_or_else(num_cpus);
	let fs = RealFileSystem;
	let mut status = LogStatus::new();

	install_interrupt_handler();

	let mut builder = Builder::new(
		&mut state,
		&mut build_log,
		&mut dep_log,
		&fs,
		&mut status,
		parallelism,
		opt.failures_allowed.max(1),
	)
	.interrupt_flag(&INTERRUPTED);

	match builder.build(&targets) {
		Ok(()) => 0,
		Err(BuildError::Failed) | Err(BuildError::Interrupted) => 1,
		Err(error) => {
			eprintln!("ninj: {}", error);
			2
		}
	}
}

fn num_cpus() -> u32 {
	std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
}

/// Set by `handle_signal` below; `Builder` polls this once per main loop
/// iteration so a `SIGINT`/`SIGTERM` while a command is running still
/// triggers cleanup instead of leaving partial outputs on disk.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: i32) {
	INTERRUPTED.store(true, Ordering::SeqCst);
}

fn install_interrupt_handler() {
	use nix::sys::signal::{signal, SigHandler, Signal};
	unsafe {
		let _ = signal(Signal::SIGINT, SigHandler::Handler(handle_signal));
		let _ = signal(Signal::SIGTERM, SigHandler::Handler(handle_signal));
	}
}
