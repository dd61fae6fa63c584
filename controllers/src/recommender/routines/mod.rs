pub mod horizontal;
pub mod metrics;
pub mod recommender;
pub mod replica_calculator;
