// src/utils/mod.rs

pub mod ip_range;
pub mod jwt;
