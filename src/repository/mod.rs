// src/repository/mod.rs

//! SQL access. Every function takes a `&mut PgConnection` so callers decide
//! whether it runs on a pooled connection or inside their transaction.

pub mod course_items;
pub mod instances;
pub mod questions;
pub mod results;
pub mod templates;
