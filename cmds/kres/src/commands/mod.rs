pub mod apply;
pub mod delete;
pub mod import;
pub mod plan;
pub mod read;
pub mod session;

pub mod util;
