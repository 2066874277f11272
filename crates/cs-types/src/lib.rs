pub mod instance;
pub mod configuration;
pub mod evaluation;
pub mod errors;

pub use instance::*;
pub use configuration::*;
pub use evaluation::*;
pub use errors::*;
