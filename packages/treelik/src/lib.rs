pub mod accel;
pub mod alignment;
pub mod core;
pub mod io;
pub mod likelihood;
pub mod models;
pub mod tree;
pub mod utils;
