//! Command execution: spawns shell processes for due commands and one-shot
//! triggers, captures output, and logs a structured report per run.

pub mod executor;

pub use executor::Executor;
