pub mod calc;
pub mod classes;
pub mod core;
pub mod curriculum;
pub mod reports;
pub mod scores;
pub mod setup;
