pub mod fs;
pub mod json;
pub mod nwk;
