//! Control plane of the uplift edge upload agent.
//!
//! Hosts the AutoUploadable feature: receives trigger/start/cancel/activate/
//! deactivate operations from the backend, drives the upload lifecycle
//! engine, schedules periodic uploads, and publishes status through the
//! local twin channel.

mod config;
mod edge;
mod file_upload;
mod mode;
mod uploadable;

pub use config::{BrokerConfig, ConfigError, DurationString, LogConfig, UploadableConfig};
pub use edge::{EdgeConfiguration, EdgeConnector, EdgeError, EdgeEvent, MqttTwinChannel};
pub use file_upload::FileUpload;
pub use mode::AccessMode;
pub use uploadable::{AutoUploadable, ErrorResponse, TwinChannel, UploadCustomizer};
