// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry/backoff policy and remote connectivity tracking.

pub mod health;
pub mod retry;
