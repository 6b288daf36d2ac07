// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Kapp cache builder.
//!
//! A __kapp__ is a versioned application bundle kept in a subdirectory of a
//! git repository. Sugarkube reads __manifests__ that list kapps and the
//! sources they consist of, fetches exactly the wanted subdirectory of each
//! source through sparse checkout, and lays everything out in a local cache
//! directory that installers can work from.
//!
//! # Cache Layout
//!
//! Every source is fetched into a hidden staging area of its kapp, and then
//! exposed through a symlink named after the source:
//!
//! ```text
//! <cache root>/<manifest id>/<kapp id>/<source name>
//!     -> .sugarkube/<source id>/<source path>
//! ```

pub mod acquirer;
pub mod cacher;
pub mod config;
pub mod manifest;
pub mod path;
pub mod process;

pub use acquirer::{Acquirer, Source};
pub use cacher::Cacher;
pub use config::Settings;
pub use manifest::{Kapp, Manifest};
