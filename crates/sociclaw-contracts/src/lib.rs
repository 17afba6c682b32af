pub mod events;
pub mod images;
pub mod jobs;
pub mod retry;
pub mod validators;
