// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database adapters.
//!
//! - [`traits`]: the [`DatabaseAdapter`](traits::DatabaseAdapter) capability set
//! - [`sql`]: sqlx-backed adapter for SQLite and Postgres

pub mod sql;
pub mod traits;
