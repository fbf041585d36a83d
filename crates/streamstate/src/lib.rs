pub mod capability;
pub mod channel;

pub use capability::{
    MessageCallback, Publisher, SetOptions, StreamStateError, StreamStateResult, Subscriber,
    message_callback,
};
pub use channel::{CHANNEL_PREFIX_LEN, MAX_CHANNEL_LEN, normalize_channel};
