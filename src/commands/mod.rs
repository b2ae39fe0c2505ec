pub mod budget;
pub mod utils;

pub use utils::init_logging;
