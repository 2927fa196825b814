//! This library crate contains all the re-usable parts of `ninj`, an
//! implementation of the `ninja` build system.
//!
//! # File formats
//!
//! This crate implements support for several file formats:
//!
//! - **`build.ninja` files**
//!
//!   The [`spec`] module contains everything you need to parse `build.ninja`
//!   files, including variable expansion, traversing other ninja files, and
//!   resolving build rules.
//!
//! - **`.ninja_log` files**
//!
//!   The [`buildlog`] module allows both reading from and writing to
//!   `.ninja_log` files,   which store how each target was built previously.
//!
//! - **`.ninja_deps` files**
//!
//!   The [`deplog`] module can read and write `.ninja_deps` files, which hold
//!   the dependency information discovered during previous builds.
//!
//! - **`Makefile`-style dependency files**
//!
//!   The [`depfile`] module can read `Makefile`-style dependency files which
//!   are written by some compilers, such as GCC and Clang.
//!
//! # Utilities
//!
//! Other than file formats, this crate also provides the following utilities:
//!
//! - **Error handling**
//!
//!   [`ErrorWithLocation`][error::ErrorWithLocation] adds location information
//!   (file name and line number) to an [`Error`][std::error::Error], so that
//!   the user can know where something went wrong while reading/parsing a file.
//!
//! - **Reading of `mtime`s**
//!
//!   The [`mtime`] module contains an [`mtime`][mtime::mtime] function, but
//!   also has a [`StatCache`][mtime::StatCache] which helps to reducing the
//!   number of `stat()` syscalls.
//!
//! - **The build graph**
//!
//!   The [`graph`] module holds the in-memory DAG ([`graph::State`]) that
//!   every other module reads from or writes into.
//!
//! - **Dependency scanning, planning, and execution**
//!
//!   [`scan`] recomputes which nodes are dirty, [`plan`] turns that into an
//!   order of edges to run (respecting pools), [`builder`] drives the
//!   [`runner`] to actually spawn and reap commands.

pub mod buildlog;
pub mod builder;
pub mod clparser;
pub mod depfile;
pub mod deplog;
pub mod dyndep;
pub mod edgeset;
pub mod error;
pub mod fs;
pub mod graph;
pub mod mtime;
pub mod path;
pub mod plan;
pub mod runner;
pub mod scan;
pub mod spec;
pub mod status;
