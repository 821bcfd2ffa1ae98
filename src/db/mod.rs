pub mod ml_queries;
