//! Unprivileged user/mount namespace entry and precondition probing.

pub mod entry;
pub mod probe;

pub use entry::{BindMount, EntryOptions};
pub use probe::collect_restrictions;
