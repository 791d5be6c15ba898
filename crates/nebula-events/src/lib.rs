//! Nebula Events - namespaced plugin events.
//!
//! Plugins never publish raw event names. The capability bridge prefixes every
//! emission with `plugin.{name}.` and hands it to an [`EventSink`]; the
//! default sink is the broadcast [`EventBus`].
//!
//! # Example
//!
//! ```rust
//! use nebula_core::PluginName;
//! use nebula_events::{EventBus, EventSink, PluginEvent};
//!
//! # async fn example() {
//! let bus = EventBus::new();
//! let mut receiver = bus.subscribe_topic("plugin.sample_sync.*");
//!
//! let plugin = PluginName::new("sample_sync").unwrap();
//! bus.emit(PluginEvent::new(&plugin, "sync.started", serde_json::json!({})))
//!     .unwrap();
//!
//! let event = receiver.recv().await.unwrap();
//! assert_eq!(event.name, "plugin.sample_sync.sync.started");
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod bus;
mod error;
mod event;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventReceiver};
pub use error::{EventError, EventResult};
pub use event::{EventSink, PluginEvent};
