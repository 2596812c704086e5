pub mod bulk;
pub mod core;
pub mod matrix;
pub mod roster;
pub mod setup;
