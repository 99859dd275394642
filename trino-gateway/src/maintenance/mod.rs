pub mod binding_sweeper;
pub mod health_checker;
