pub mod core;
pub mod reportcards;
