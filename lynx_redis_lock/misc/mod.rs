mod cancel;
mod retry;
mod sleep_compat;

pub use cancel::*;
pub use retry::*;
pub use sleep_compat::*;
