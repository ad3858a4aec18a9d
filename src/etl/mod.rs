//! The ETL core: admission control, schema mapping, validation, extraction,
//! outlier metering, and the run orchestrator.

pub mod extractor;
pub mod orchestrator;
pub mod outliers;
pub mod rate_gate;
pub mod schema_mapper;
pub mod validator;


pub use extractor::{RecordFetcher, SourceExtractor};
pub use orchestrator::Orchestrator;
pub use rate_gate::{Admission, PayloadCache, RateGate};
pub use schema_mapper::{DriftResult, SchemaMapper};
