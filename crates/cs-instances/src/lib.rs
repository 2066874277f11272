pub mod mps;
pub mod features;
pub mod cache;
pub mod catalog;
pub mod selection;
pub mod projection;
pub mod filter;

pub use mps::*;
pub use features::*;
pub use cache::*;
pub use catalog::*;
pub use selection::*;
pub use projection::*;
pub use filter::*;
