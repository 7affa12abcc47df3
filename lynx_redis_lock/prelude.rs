#[allow(unused_imports)]
pub use error_stack::{Report, Result, ResultExt};
#[allow(unused_imports)]
pub use tracing::{debug, error, info, warn};

#[allow(unused_imports)]
pub use crate::errors::prelude::*;

/// Shorthand for a [`Result`] with a [`Report`] as the error variant.
#[allow(dead_code)]
pub type RResult<T, C> = Result<T, Report<C>>;
