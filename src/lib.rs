mod client;
mod config;
mod diff;
mod error;
mod logger;
mod manager;
mod protocol;
mod queue;
mod state;
mod types;

pub use client::{DeviceApi, DeviceClient, DeviceClientBuilder};
pub use config::{AutoFanPolicy, DeviceConfig, FeatureFlags, RetryConfig, DEFAULT_PORT};
pub use diff::StateDiff;
pub use error::{Error, Result};
pub use logger::MessageLogMode;
pub use manager::{CacheEntry, DeviceManager};
pub use protocol::{
    parse_response, parse_status, set_message, status_request, SetCommand, WireResponse,
    DEFAULT_SLEEP_PROFILE,
};
pub use queue::{CommandQueue, CommandTicket, QueueEvent};
pub use state::{DeviceState, Settings, StateListener, MAX_TARGET_C, MIN_TARGET_C};
pub use types::*;
