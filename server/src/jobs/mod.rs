pub mod key_package_cleanup;
pub mod presence_cleanup;
pub mod retention;

pub use key_package_cleanup::run_key_package_cleanup_worker;
pub use presence_cleanup::run_presence_cleanup_worker;
pub use retention::run_retention_worker;
