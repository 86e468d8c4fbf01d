// cms_importer/src/lib.rs
// Idempotent import of JSON exports into content-management collections.

pub mod catalog;
pub mod cli;
pub mod entity;
pub mod error;
pub mod linker;
pub mod memory;
pub mod reader;
pub mod report;
pub mod retry;
pub mod runner;
pub mod sqlite;
pub mod store;
pub mod strapi;
pub mod upsert;

pub const DEFAULT_STORE_URL: &str = "http://localhost:1337";
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_REPORT_PATH: &str = "import_report.json";
