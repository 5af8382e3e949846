pub mod aggregator;
pub mod connections;
pub mod fetcher;
pub mod gateway;
pub mod normalizer;
pub mod oauth;
pub mod router;
