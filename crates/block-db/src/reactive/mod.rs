pub mod binding;
pub mod broadcast;
pub mod emitter;
pub mod live;
pub mod registry;

pub use binding::LiveBinding;
pub use broadcast::{BroadcastHub, Envelope};
pub use emitter::{Emitter, ListenerFn, ListenerId};
pub use live::{LiveSubscription, QueryUpdate};
pub use registry::{SubscriptionHandle, SubscriptionRegistry};
