pub mod check_config;
pub mod mount;
pub mod version;

pub use check_config::CheckConfig;
pub use mount::Mount;
pub use version::Version;
