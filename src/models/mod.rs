mod alert_log;
mod blacklist_event;
mod ids;
mod ip;
mod ip_event;
mod tenant;
mod warmup;

pub use alert_log::*;
pub use blacklist_event::*;
pub use ids::*;
pub use ip::*;
pub use ip_event::*;
pub use tenant::*;
pub use warmup::*;

pub use crate::error::Error;
