// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Conversion of Android partition images into block-based OTA transfer lists.
//!
//! img2sdat is primarily an application. The semver versioning covers the CLI
//! only and the Rust APIs can change at any time.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic.

pub mod apply;
pub mod cli;
pub mod config;
pub mod diff;
pub mod encode;
pub mod format;
pub mod image;
pub mod stream;
pub mod util;
