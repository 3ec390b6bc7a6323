pub mod compute;
pub mod render;
