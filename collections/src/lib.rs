pub mod arena;
pub mod bytes;
