pub mod broadcaster;
pub mod frame;

pub use broadcaster::{ChannelError, EventBroadcaster, ObserverChannel, ObserverId, Subscription};
pub use frame::Frame;
