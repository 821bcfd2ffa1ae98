pub mod health;
pub mod ml;
