pub mod recovery;
pub mod script;
pub mod storage;
pub mod types;
pub mod utils;
