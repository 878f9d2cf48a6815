//! Operator tooling for the featstore retrieval pipeline.

pub mod report;
