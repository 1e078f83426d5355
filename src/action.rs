pub mod reduce;
pub mod validate;

pub use reduce::{apply_action, apply_actions};
pub use validate::validate;
