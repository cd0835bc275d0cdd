#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod adapter;
pub mod augment;
pub mod blend;
pub mod config;
pub mod pipeline;
pub mod probe;
pub mod tta;
pub mod types;

#[path = "../features/mod.rs"]
pub mod features;

#[path = "../shared/files.rs"]
pub mod files;
