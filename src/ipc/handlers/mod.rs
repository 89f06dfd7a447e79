pub mod backup;
pub mod core;
pub mod export;
pub mod report;
pub mod scores;
pub mod setup;
pub mod students;
pub mod tokens;
