pub mod migrators;
pub mod postgres;
