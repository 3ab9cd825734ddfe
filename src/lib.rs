pub mod artifact;
pub mod backend;
pub mod distill;
pub mod engine;
pub mod errors;
pub mod orchestrator;
pub mod prompts;
pub mod review;
pub mod router;
pub mod step;
pub mod store;
pub mod util;
