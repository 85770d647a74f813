// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends.
//!
//! - [`local`]: SQLite-backed durable entity tables (the local store)
//! - [`memory`]: in-process cache storage for the read cache
//! - [`traits`]: error types and the [`traits::CacheStore`] seam

pub mod local;
pub mod memory;
pub mod traits;
