//! Publish/subscribe registry: channel membership plus the writer handles
//! PUBLISH fans out through.

use crate::protocol::Frame;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::TcpStream;
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct Registry {
    session_channels: HashMap<u64, HashSet<String>>,
    channel_sessions: HashMap<String, HashSet<u64>>,
    writers: HashMap<u64, TcpStream>,
}

/// Global pub/sub state, keyed by session id
pub(crate) struct PubSub {
    inner: Mutex<Registry>,
}

impl PubSub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
        }
    }

    /// make the session reachable for PUBLISH fan-out
    pub fn register_writer(&self, session: u64, writer: TcpStream) {
        let mut inner = self.inner.lock().unwrap();
        inner.writers.insert(session, writer);
    }

    /// add the session to a channel; returns its subscription count
    pub fn subscribe(&self, session: u64, channel: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner
            .channel_sessions
            .entry(channel.to_string())
            .or_default()
            .insert(session);
        let channels = inner.session_channels.entry(session).or_default();
        channels.insert(channel.to_string());
        channels.len()
    }

    /// Drop the session from the given channels, or from every channel when
    /// none are named. Returns one `(channel, remaining)` confirmation per
    /// processed channel; `remaining` counts the session's subscriptions
    /// left after that removal.
    pub fn unsubscribe(&self, session: u64, channels: &[String]) -> Vec<(Option<String>, usize)> {
        let mut inner = self.inner.lock().unwrap();
        let targets: Vec<String> = if channels.is_empty() {
            let mut all: Vec<String> = inner
                .session_channels
                .get(&session)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            all.sort();
            all
        } else {
            channels.to_vec()
        };

        if targets.is_empty() {
            return vec![(None, 0)];
        }

        let mut confirmations = Vec::with_capacity(targets.len());
        for channel in targets {
            if let Some(sessions) = inner.channel_sessions.get_mut(&channel) {
                sessions.remove(&session);
                if sessions.is_empty() {
                    inner.channel_sessions.remove(&channel);
                }
            }
            let remaining = match inner.session_channels.get_mut(&session) {
                Some(set) => {
                    set.remove(&channel);
                    set.len()
                }
                None => 0,
            };
            confirmations.push((Some(channel), remaining));
        }
        if let Some(set) = inner.session_channels.get(&session) {
            if set.is_empty() {
                inner.session_channels.remove(&session);
            }
        }
        confirmations
    }

    /// true while the session has at least one subscription
    pub fn is_subscribed(&self, session: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .session_channels
            .get(&session)
            .map_or(false, |set| !set.is_empty())
    }

    /// Deliver a message to every subscriber of the channel except the
    /// publisher; returns the number of deliveries. Sends happen under the
    /// registry lock so each subscriber observes publishes in order.
    pub fn publish(&self, publisher: u64, channel: &str, message: &str) -> usize {
        let frame = Frame::Array(vec![
            Frame::Bulk(String::from("message")),
            Frame::Bulk(channel.to_string()),
            Frame::Bulk(message.to_string()),
        ])
        .encode();

        let inner = self.inner.lock().unwrap();
        let subscribers = match inner.channel_sessions.get(channel) {
            Some(subscribers) => subscribers,
            None => return 0,
        };
        let mut delivered = 0;
        for session in subscribers {
            if *session == publisher {
                continue;
            }
            if let Some(mut writer) = inner.writers.get(session) {
                if let Err(error) = writer.write_all(&frame) {
                    // the peer's own session will notice and clean up
                    debug!("pubsub delivery to session {} failed: {}", session, error);
                    continue;
                }
            }
            delivered += 1;
        }
        delivered
    }

    /// forget a disconnected session entirely
    pub fn disconnect(&self, session: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(channels) = inner.session_channels.remove(&session) {
            for channel in channels {
                if let Some(sessions) = inner.channel_sessions.get_mut(&channel) {
                    sessions.remove(&session);
                    if sessions.is_empty() {
                        inner.channel_sessions.remove(&channel);
                    }
                }
            }
        }
        inner.writers.remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    // a connected socket pair: the write end goes into the registry, the
    // read end plays the subscriber's client
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (server_side, client)
    }

    #[test]
    fn subscribe_counts_grow_per_session() {
        let pubsub = PubSub::new();
        assert_eq!(pubsub.subscribe(1, "a"), 1);
        assert_eq!(pubsub.subscribe(1, "b"), 2);
        assert_eq!(pubsub.subscribe(1, "b"), 2);
        assert_eq!(pubsub.subscribe(2, "a"), 1);
        assert!(pubsub.is_subscribed(1));
    }

    #[test]
    fn unsubscribe_all_reports_each_channel_and_clears_the_mode() {
        let pubsub = PubSub::new();
        pubsub.subscribe(1, "b");
        pubsub.subscribe(1, "a");
        let confirmations = pubsub.unsubscribe(1, &[]);
        assert_eq!(
            confirmations,
            vec![(Some(String::from("a")), 1), (Some(String::from("b")), 0)]
        );
        assert!(!pubsub.is_subscribed(1));
    }

    #[test]
    fn unsubscribe_with_no_subscriptions_still_confirms() {
        let pubsub = PubSub::new();
        assert_eq!(pubsub.unsubscribe(9, &[]), vec![(None, 0)]);
    }

    #[test]
    fn publish_reaches_subscribers_but_not_the_publisher() {
        let pubsub = PubSub::new();
        let (writer, mut client) = socket_pair();
        pubsub.register_writer(1, writer);
        pubsub.subscribe(1, "news");
        pubsub.subscribe(2, "news"); // the publisher is itself subscribed

        assert_eq!(pubsub.publish(2, "news", "hello"), 1);

        let expected = Frame::Array(vec![
            Frame::Bulk("message".into()),
            Frame::Bulk("news".into()),
            Frame::Bulk("hello".into()),
        ])
        .encode();
        let mut got = vec![0u8; expected.len()];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn publish_to_an_empty_channel_delivers_nothing() {
        let pubsub = PubSub::new();
        assert_eq!(pubsub.publish(1, "ghost", "x"), 0);
    }

    #[test]
    fn disconnect_removes_the_session_everywhere() {
        let pubsub = PubSub::new();
        let (writer, _client) = socket_pair();
        pubsub.register_writer(1, writer);
        pubsub.subscribe(1, "a");
        pubsub.disconnect(1);
        assert!(!pubsub.is_subscribed(1));
        assert_eq!(pubsub.publish(2, "a", "x"), 0);
    }
}
