pub mod attributes;
pub mod extract;
pub mod grouping;
pub mod holistic;
pub mod listing;
pub mod similarity;
pub mod synonyms;
