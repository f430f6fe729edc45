mod duration;
mod session;
mod session_id;

pub use duration::*;
pub use session::*;
pub use session_id::*;
