pub mod compactor;
pub mod console;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod password;
pub mod pricing;
pub mod wal;
