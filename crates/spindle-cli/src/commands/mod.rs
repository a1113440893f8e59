pub mod count;
pub mod info;
pub mod queue;
