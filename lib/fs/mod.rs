//! An indirection over real filesystem operations.
//!
//! [`crate::builder`] goes through this trait instead of calling
//! `std::fs` directly, so a test can drive it against [`RealFileSystem`]
//! or a fake that only pretends to touch disk.

use crate::mtime::Timestamp;
use std::io;
use std::path::Path;

pub trait FileSystem {
	/// The current mtime of `path`, or `None` if it doesn't exist.
	fn stat(&self, path: &Path) -> io::Result<Option<Timestamp>>;

	fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

	fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

	/// Creates a single directory. Not recursive; see [`make_dirs`].
	///
	/// [`make_dirs`]: FileSystem::make_dirs
	fn make_dir(&self, path: &Path) -> io::Result<()>;

	/// Removes a file. A missing file is not an error: the `bool` is
	/// `false` if there was nothing to remove.
	fn remove_file(&self, path: &Path) -> io::Result<bool>;

	/// Creates every missing ancestor directory of `path`, so that a
	/// command writing to `path` can assume its parent directory exists.
	fn make_dirs(&self, path: &Path) -> io::Result<()> {
		let dir = match path.parent() {
			Some(dir) if !dir.as_os_str().is_empty() => dir,
			_ => return Ok(()),
		};
		let mut missing = Vec::new();
		let mut cur = dir;
		loop {
			if self.stat(cur)?.is_some() {
				break;
			}
			missing.push(cur);
			match cur.parent() {
				Some(parent) if !parent.as_os_str().is_empty() => cur = parent,
				_ => break,
			}
		}
		for dir in missing.into_iter().rev() {
			match self.make_dir(dir) {
				Ok(()) => {}
				Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
				Err(e) => return Err(e),
			}
		}
		Ok(())
	}
}

/// The real filesystem, via `std::fs`.
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
	fn stat(&self, path: &Path) -> io::Result<Option<Timestamp>> {
		crate::mtime::mtime(path)
	}

	fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
		std::fs::read(path)
	}

	fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
		std::fs::write(path, contents)
	}

	fn make_dir(&self, path: &Path) -> io::Result<()> {
		match std::fs::create_dir(path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
			Err(e) => Err(e),
		}
	}

	fn remove_file(&self, path: &Path) -> io::Result<bool> {
		match std::fs::remove_file(path) {
			Ok(()) => Ok(true),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
			Err(e) => Err(e),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn make_dirs_creates_missing_ancestors() {
		let base = std::env::temp_dir().join("ninj-test-fs-make-dirs");
		std::fs::remove_dir_all(&base).ok();
		let fs = RealFileSystem;
		let target = base.join("a/b/c/out.txt");
		fs.make_dirs(&target).unwrap();
		assert!(base.join("a/b/c").is_dir());
		std::fs::remove_dir_all(&base).ok();
	}

	#[test]
	fn remove_file_reports_whether_anything_was_removed() {
		let path = std::env::temp_dir().join("ninj-test-fs-remove-file");
		std::fs::write(&path, b"x").unwrap();
		let fs = RealFileSystem;
		assert!(fs.remove_file(&path).unwrap());
		assert!(!fs.remove_file(&path).unwrap());
	}
}
