//! Trinity phone/watch telemetry protocol reference implementation.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod continuity;
pub mod controller;
pub mod handler;
pub mod protocol;
pub mod sample;
pub mod sensor;
pub mod wire;

pub use continuity::{AppState, ContinuityAction, ContinuityManager, TaskId};
pub use controller::{
    ControlError, ControllerConfig, PhoneAction, PhoneSessionState, SessionController,
    WatchConnectionStatus,
};
pub use handler::{CommandHandler, WatchAction};
pub use protocol::{Command, Envelope, HeartRateData, Payload, RequestId, PROTOCOL_VERSION};
pub use sample::{RecentSampleWindow, Sample, SessionStatistics};
pub use sensor::{Metric, Reading, SensorAccess, SensorAction, SensorError, SensorSession};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};

