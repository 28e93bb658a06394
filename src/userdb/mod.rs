//! Replicated user directory: accounts keyed by email, mutated only by
//! committed 2PC transactions.

mod directory;
mod user;

pub use directory::{DirectoryOp, UserDirectory};
pub use user::User;
