mod capture;
mod fs_safety;
mod paths;
mod process;
mod retention;
mod store;
pub(crate) mod transport;
mod watch;

pub use capture::*;
pub use fs_safety::*;
pub use paths::*;
pub use process::*;
pub use retention::*;
pub use store::*;
pub use transport::*;
pub use watch::*;
