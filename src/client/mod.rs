//! Client-side stub of the node API.

mod apistub;

pub use apistub::ClientApiStub;
