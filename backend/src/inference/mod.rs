pub mod error;
pub mod fusion;
pub mod resilient;
pub mod response;
pub mod service;

pub use error::PredictError;
pub use fusion::{OrientationSample, TieBreakScores};
pub use resilient::{ResilientInvoker, RetrySchedule};
pub use service::PredictService;
