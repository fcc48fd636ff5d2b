pub mod check;
pub mod cluster;
pub mod collector;
pub mod config;
pub mod events;
pub mod executors;
pub mod powheg;
pub mod resubmit;
pub mod runner;
pub mod simulation;
pub mod submit;
pub mod sync;
