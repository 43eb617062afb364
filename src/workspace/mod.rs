pub mod detection;
pub mod documents;
