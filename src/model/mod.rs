pub mod condition;
pub mod subscription;
pub mod tick;
