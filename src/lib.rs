pub mod auth;
pub mod call;
pub mod config;
pub mod dialog;
pub mod error;
pub mod event;
pub mod media;
pub mod net_tool;
pub mod sdp;
pub mod transaction;
pub mod transport;
pub mod useragent;
pub mod version;

pub use call::{CallController, CallState, PhoneState, RegistrationStatus};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventKind, EventReceiver};
pub use useragent::{UserAgent, UserAgentBuilder};
