/// wire-level message model shared by senders, monitors and the transport
///
use hashbrown::HashMap;
use serde_json::Value;

/// header key used to carry an expiration hint, in milliseconds
pub const EXPIRATION_HEADER: &str = "expiration";

/// routing key that matches every cache key on a topic exchange
pub const GLOBAL_ROUTING_KEY: &str = "#";

pub type Headers = HashMap<String, Value>;

/// The declared type of a bus message.  The string forms are the wire
/// contract shared with remote cache-node peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Store,
    Load,
    Clear,
    Ping,
    Pong,
    Response,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Store => "store",
            MessageType::Load => "load",
            MessageType::Clear => "clear",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Response => "response",
        }
    }

    /// parse a wire type string; unknown types return None and are
    /// handled (logged and dropped) by the consumer loops
    pub fn parse(s: &str) -> Option<MessageType> {
        match s {
            "store" => Some(MessageType::Store),
            "load" => Some(MessageType::Load),
            "clear" => Some(MessageType::Clear),
            "ping" => Some(MessageType::Ping),
            "pong" => Some(MessageType::Pong),
            "response" => Some(MessageType::Response),
            _ => None,
        }
    }
}

/// Standard properties stamped on each published message.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    /// wire type string, e.g. "store"
    pub message_type: String,
    /// the sender's instance id; responses are routed back to this queue
    pub reply_to: String,
    /// links a request to its eventual response; the cache key
    pub correlation_id: Option<String>,
    pub headers: Headers,
}

/// A message received from a consumer, with its envelope routing key.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub properties: Properties,
    pub body: Vec<u8>,
}

/// A store request carrying an opaque serialized payload.
#[derive(Debug, Clone)]
pub struct ObjectMessage {
    /// the cache key; also the routing key and correlation id
    pub id: String,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl ObjectMessage {
    pub fn store(id: &str, exchange: &str, body: Vec<u8>) -> ObjectMessage {
        ObjectMessage {
            id: id.to_string(),
            exchange: exchange.to_string(),
            routing_key: id.to_string(),
            body,
            headers: Headers::new(),
        }
    }

    /// attach an expiration hint; remote nodes may ignore it
    pub fn with_expiry(mut self, expiry_ms: u64) -> ObjectMessage {
        self.headers
            .insert(EXPIRATION_HEADER.to_string(), Value::from(expiry_ms));
        self
    }
}

/// A control message: load, clear or ping.
#[derive(Debug, Clone)]
pub struct CommandMessage {
    pub kind: MessageType,
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
}

impl CommandMessage {
    pub fn load(id: &str, exchange: &str) -> CommandMessage {
        CommandMessage {
            kind: MessageType::Load,
            exchange: exchange.to_string(),
            routing_key: id.to_string(),
            headers: Headers::new(),
        }
    }

    pub fn clear(id: &str, exchange: &str) -> CommandMessage {
        CommandMessage {
            kind: MessageType::Clear,
            exchange: exchange.to_string(),
            routing_key: id.to_string(),
            headers: Headers::new(),
        }
    }

    /// a clear addressed to every routing key
    pub fn clear_all(exchange: &str) -> CommandMessage {
        CommandMessage::clear(GLOBAL_ROUTING_KEY, exchange)
    }

    /// a deferred clear; the delay rides as an expiration header hint
    pub fn clear_delayed(id: &str, exchange: &str, delay_ms: u64) -> CommandMessage {
        let mut cmd = CommandMessage::clear(id, exchange);
        cmd.headers
            .insert(EXPIRATION_HEADER.to_string(), Value::from(delay_ms));
        cmd
    }

    /// a liveness solicitation, sent on the heartbeat exchange with an
    /// empty routing key
    pub fn ping(exchange: &str) -> CommandMessage {
        CommandMessage {
            kind: MessageType::Ping,
            exchange: exchange.to_string(),
            routing_key: String::new(),
            headers: Headers::new(),
        }
    }
}
