// src/models/mod.rs

pub mod course_item;
pub mod instance;
pub mod question;
pub mod result;
pub mod template;
pub mod test;
