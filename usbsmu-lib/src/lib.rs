pub mod calibration;
pub mod codec;
pub mod coefficients;
pub mod constants;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod logger;
pub mod quantity;
pub mod regression;
pub mod samples;
pub mod transport;

// Re-export the main types for easy access
pub use coefficients::CoefficientSet;
pub use device::Smu;
pub use error::{Result, SmuError};
pub use quantity::{DeviceGeneration, Quantity};
pub use samples::{SampleBuffer, SampleRecord};
pub use transport::{HttpTransport, Transport};
