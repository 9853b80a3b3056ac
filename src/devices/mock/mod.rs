//! Simulated devices used by the test suites

mod machine;
mod mmu;

pub use machine::SimCoreXy;
pub use mmu::ScriptedLink;
