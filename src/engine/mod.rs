// src/engine/mod.rs

//! Pure engine logic. Nothing in here touches the database; repositories load
//! rows, the engine decides, handlers persist the outcome.

pub mod answers;
pub mod cache;
pub mod error;
pub mod lifecycle;
pub mod sampler;
pub mod scoring;
pub mod steps;
