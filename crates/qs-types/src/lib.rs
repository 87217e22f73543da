pub mod configuration;
pub mod diagnostics;
pub mod errors;
pub mod evaluator;
pub mod history;
pub mod near_axis;

pub use configuration::*;
pub use diagnostics::*;
pub use errors::*;
pub use evaluator::*;
pub use history::*;
pub use near_axis::*;
