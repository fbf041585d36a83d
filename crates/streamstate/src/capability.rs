use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Invoked with the payload of every message delivered to a subscribed channel.
pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;

pub fn message_callback<F>(callback: F) -> MessageCallback
where
    F: Fn(String) + Send + Sync + 'static,
{
    Arc::new(callback)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetOptions {
    /// Relative expiry in seconds. `Some(0)` stores an entry that is already expired.
    pub expire_seconds: Option<u64>,
}

impl SetOptions {
    pub fn expire_in(seconds: u64) -> Self {
        Self {
            expire_seconds: Some(seconds),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamStateError {
    /// The counter slot holds a value that is not a 64-bit integer, typically a
    /// terminal sentinel written when a stream completed.
    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(Box<dyn std::error::Error + Send + Sync>),
}

impl StreamStateError {
    pub fn is_not_an_integer(&self) -> bool {
        matches!(self, Self::NotAnInteger)
    }
}

pub type StreamStateResult<T> = Result<T, StreamStateError>;

#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn connect(&self) -> StreamStateResult<()>;

    /// Returns the number of receivers when the backend can observe it, `0` otherwise.
    async fn publish(&self, channel: &str, message: &str) -> StreamStateResult<u64>;

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> StreamStateResult<()>;

    async fn get(&self, key: &str) -> StreamStateResult<Option<String>>;

    /// Fails with [`StreamStateError::NotAnInteger`] when the stored value is not numeric.
    async fn incr(&self, key: &str) -> StreamStateResult<i64>;
}

#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    async fn connect(&self) -> StreamStateResult<()>;

    /// Replaces any callback already registered for `channel`.
    async fn subscribe(&self, channel: &str, on_message: MessageCallback)
    -> StreamStateResult<()>;

    /// Unknown channels are a no-op.
    async fn unsubscribe(&self, channel: &str) -> StreamStateResult<()>;
}

#[async_trait::async_trait]
impl<T> Publisher for Arc<T>
where
    T: Publisher + ?Sized,
{
    async fn connect(&self) -> StreamStateResult<()> {
        (**self).connect().await
    }

    async fn publish(&self, channel: &str, message: &str) -> StreamStateResult<u64> {
        (**self).publish(channel, message).await
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> StreamStateResult<()> {
        (**self).set(key, value, options).await
    }

    async fn get(&self, key: &str) -> StreamStateResult<Option<String>> {
        (**self).get(key).await
    }

    async fn incr(&self, key: &str) -> StreamStateResult<i64> {
        (**self).incr(key).await
    }
}

#[async_trait::async_trait]
impl<T> Subscriber for Arc<T>
where
    T: Subscriber + ?Sized,
{
    async fn connect(&self) -> StreamStateResult<()> {
        (**self).connect().await
    }

    async fn subscribe(
        &self,
        channel: &str,
        on_message: MessageCallback,
    ) -> StreamStateResult<()> {
        (**self).subscribe(channel, on_message).await
    }

    async fn unsubscribe(&self, channel: &str) -> StreamStateResult<()> {
        (**self).unsubscribe(channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn not_an_integer_expected_counter_type_error_text() {
        let error = StreamStateError::NotAnInteger;
        assert!(error.is_not_an_integer());
        assert_eq!(
            error.to_string(),
            "ERR value is not an integer or out of range"
        );
    }

    #[test]
    fn store_error_expected_transparent_display_and_source() {
        let inner = std::io::Error::other("relation does not exist");
        let error = StreamStateError::Store(Box::new(inner));
        assert!(!error.is_not_an_integer());
        assert_eq!(error.to_string(), "relation does not exist");
        assert!(std::error::Error::source(&error).is_none());
    }

    #[test]
    fn set_options_expected_serde_shape() {
        let options = SetOptions::expire_in(30);
        let encoded = serde_json::to_value(options).expect("options should serialize");
        assert_eq!(encoded, serde_json::json!({ "expire_seconds": 30 }));
        assert_eq!(SetOptions::default().expire_seconds, None);
    }

    struct RecordingSubscriber {
        channels: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Subscriber for RecordingSubscriber {
        async fn connect(&self) -> StreamStateResult<()> {
            Ok(())
        }

        async fn subscribe(
            &self,
            channel: &str,
            on_message: MessageCallback,
        ) -> StreamStateResult<()> {
            self.channels
                .lock()
                .expect("mutex should lock")
                .push(channel.to_string());
            on_message(format!("subscribed:{channel}"));
            Ok(())
        }

        async fn unsubscribe(&self, _channel: &str) -> StreamStateResult<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn arc_subscriber_expected_delegates_to_inner() {
        let inner = Arc::new(RecordingSubscriber {
            channels: Mutex::new(Vec::new()),
        });
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let shared: Arc<dyn Subscriber> = inner.clone();
        shared
            .subscribe(
                "stream-1",
                message_callback(move |payload| {
                    sink.lock().expect("mutex should lock").push(payload);
                }),
            )
            .await
            .expect("subscribe should succeed");

        assert_eq!(
            *inner.channels.lock().expect("mutex should lock"),
            vec!["stream-1".to_string()]
        );
        assert_eq!(
            *received.lock().expect("mutex should lock"),
            vec!["subscribed:stream-1".to_string()]
        );
    }
}
