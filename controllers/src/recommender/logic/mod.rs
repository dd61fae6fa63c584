pub mod capping;
pub mod estimator;
pub mod recommender;
