pub mod calibration;
pub mod camera;
pub mod config;
pub mod display;
pub mod error;
pub mod predictor;
pub mod recorder;
pub mod session;
pub mod tracking;

pub use config::EngineConfig;
pub use error::EngineError;
pub use session::{SessionController, SessionStats};
pub use tracking::{TrackingSample, TrackingStatus};
