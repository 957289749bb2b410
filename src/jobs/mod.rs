//! Built-in job bodies run by the operation queue.

pub mod import;
pub mod organize;

pub use import::{ImportJob, ImportSummary};
pub use organize::{OrganizeJob, OrganizeSummary};

pub const IMPORT: &str = "import";
pub const ORGANIZE: &str = "organize";
