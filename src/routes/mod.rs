pub mod health;
pub mod metrics;
pub mod stream;
pub mod validate;
