//! netwatch-notify: Rate-limited, fan-out notification delivery.
//!
//! A [`Dispatcher`] accepts notifications, drops repeats through a
//! [`RateLimiter`], persists what survives, and hands it to a background
//! consumer that delivers to every enabled [`Channel`].

pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod limiter;

pub use channel::{build_channels, Channel, ConsoleChannel, SystemChannel, WebhookChannel};
pub use dispatcher::{Dispatch, Dispatcher, DispatcherSettings};
pub use error::{DeliveryError, NotifyError};
pub use limiter::RateLimiter;
