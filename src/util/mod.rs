pub mod buffered_emitter;
pub mod load_estimator;
