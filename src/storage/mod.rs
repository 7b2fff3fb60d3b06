pub mod btree;
pub mod config;
pub mod database;
pub mod header;
pub mod heap;
pub mod lob;
pub mod page_store;
pub mod schema;
pub mod wal;
