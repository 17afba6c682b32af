pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod resolver;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{JobClient, JobRequest, PollSettings};
pub use config::{ClientConfig, GeneratorConfig, ResolverConfig};
pub use error::EngineError;
pub use orchestrator::{CreditLedger, ImageGenerator, UNLIMITED_CREDITS};
pub use resolver::ImageInputResolver;
pub use transport::{HttpTransport, ReqwestTransport, RetryTransport};
