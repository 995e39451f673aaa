//! Engine.IO v4 / Socket.IO v5 text framing over a websocket
//!
//! Only the default namespace and text events are supported; binary
//! attachments are rejected.

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::{Error, Result};

/// Handshake data sent by the server in the Engine.IO `open` packet
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

impl OpenInfo {
    /// Longest silence tolerated before the transport is considered dead
    pub fn heartbeat_deadline(&self) -> Duration {
        Duration::from_millis(self.ping_interval.saturating_add(self.ping_timeout))
    }
}

/// A decoded websocket text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping(String),
    Pong(String),
    Noop,
    /// Namespace connected; carries the socket id
    Connect { sid: Option<String> },
    Disconnect,
    Event { name: String, payload: Option<Value> },
    ConnectError(Value),
}

impl Packet {
    pub fn event(name: impl Into<String>, payload: Option<Value>) -> Self {
        Packet::Event {
            name: name.into(),
            payload,
        }
    }
}

pub fn decode(frame: &str) -> Result<Packet> {
    let mut chars = frame.chars();
    let kind = chars
        .next()
        .ok_or_else(|| Error::Channel("empty frame".to_string()))?;
    let rest = chars.as_str();

    match kind {
        '0' => {
            let info: OpenInfo = serde_json::from_str(rest)
                .map_err(|e| Error::Channel(format!("bad open packet: {}", e)))?;
            Ok(Packet::Open(info))
        }
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping(rest.to_string())),
        '3' => Ok(Packet::Pong(rest.to_string())),
        '4' => decode_message(rest),
        '6' => Ok(Packet::Noop),
        other => Err(Error::Channel(format!(
            "unsupported engine.io packet type '{}'",
            other
        ))),
    }
}

fn decode_message(body: &str) -> Result<Packet> {
    let mut chars = body.chars();
    let kind = chars
        .next()
        .ok_or_else(|| Error::Channel("empty socket.io packet".to_string()))?;
    let rest = chars.as_str();

    if rest.starts_with('/') {
        return Err(Error::Channel(format!(
            "namespaced packet not supported: {}",
            body
        )));
    }

    match kind {
        '0' => {
            let sid = if rest.is_empty() {
                None
            } else {
                let v: Value = serde_json::from_str(rest)?;
                v.get("sid").and_then(Value::as_str).map(str::to_string)
            };
            Ok(Packet::Connect { sid })
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            // Optional ack id precedes the JSON array
            let json = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            let args: Vec<Value> = serde_json::from_str(json)?;
            let mut args = args.into_iter();
            let name = match args.next() {
                Some(Value::String(name)) => name,
                _ => {
                    return Err(Error::Channel(format!(
                        "event packet without a name: {}",
                        body
                    )))
                }
            };
            Ok(Packet::Event {
                name,
                payload: args.next(),
            })
        }
        '4' => {
            let v = if rest.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(rest)?
            };
            Ok(Packet::ConnectError(v))
        }
        other => Err(Error::Channel(format!(
            "unsupported socket.io packet type '{}'",
            other
        ))),
    }
}

pub fn encode(packet: &Packet) -> Result<String> {
    let frame = match packet {
        Packet::Open(info) => format!(
            "0{}",
            serde_json::json!({
                "sid": info.sid,
                "pingInterval": info.ping_interval,
                "pingTimeout": info.ping_timeout,
            })
        ),
        Packet::Close => "1".to_string(),
        Packet::Ping(data) => format!("2{}", data),
        Packet::Pong(data) => format!("3{}", data),
        Packet::Noop => "6".to_string(),
        Packet::Connect { sid: None } => "40".to_string(),
        Packet::Connect { sid: Some(sid) } => {
            format!("40{}", serde_json::json!({ "sid": sid }))
        }
        Packet::Disconnect => "41".to_string(),
        Packet::Event { name, payload } => {
            let mut args = vec![Value::String(name.clone())];
            args.extend(payload.iter().cloned());
            format!("42{}", serde_json::to_string(&args)?)
        }
        Packet::ConnectError(v) => format!("44{}", v),
    };
    Ok(frame)
}

/// Rewrites a server base url (`https://host`) into the websocket endpoint
pub fn endpoint_url(base: &str) -> Result<Url> {
    let mut url =
        Url::parse(base).map_err(|e| Error::InvalidConfig(format!("bad signaling url: {}", e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::InvalidConfig(format!(
                "unsupported signaling scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::InvalidConfig("cannot change url scheme".to_string()))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/socket.io/");
    }
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_open() {
        let p = decode(r#"0{"sid":"lv_VI97HAXpY6yYWAAAC","upgrades":[],"pingInterval":25000,"pingTimeout":5000,"maxPayload":1000000}"#).unwrap();
        match p {
            Packet::Open(info) => {
                assert_eq!(info.sid, "lv_VI97HAXpY6yYWAAAC");
                assert_eq!(info.heartbeat_deadline(), Duration::from_millis(30_000));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_deadline_saturates() {
        let p = decode(&format!(
            r#"0{{"sid":"x","pingInterval":{},"pingTimeout":{}}}"#,
            u64::MAX,
            u64::MAX
        ))
        .unwrap();
        match p {
            Packet::Open(info) => {
                assert_eq!(info.heartbeat_deadline(), Duration::from_millis(u64::MAX));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_connect_with_sid() {
        assert_eq!(
            decode(r#"40{"sid":"wZX3oN0bSVIhsaknAAAI"}"#).unwrap(),
            Packet::Connect {
                sid: Some("wZX3oN0bSVIhsaknAAAI".into())
            }
        );
        assert_eq!(decode("40").unwrap(), Packet::Connect { sid: None });
    }

    #[test]
    fn test_decode_event() {
        assert_eq!(
            decode(r#"42["match_found","abc"]"#).unwrap(),
            Packet::event("match_found", Some(json!("abc")))
        );
        assert_eq!(
            decode(r#"42["disconnect_peer"]"#).unwrap(),
            Packet::event("disconnect_peer", None)
        );
    }

    #[test]
    fn test_decode_event_with_ack_id() {
        assert_eq!(
            decode(r#"4213["message","hi"]"#).unwrap(),
            Packet::event("message", Some(json!("hi")))
        );
    }

    #[test]
    fn test_decode_heartbeat_and_errors() {
        assert_eq!(decode("2").unwrap(), Packet::Ping(String::new()));
        assert_eq!(decode("3probe").unwrap(), Packet::Pong("probe".into()));
        assert_eq!(decode("1").unwrap(), Packet::Close);
        assert_eq!(decode("41").unwrap(), Packet::Disconnect);
        assert_eq!(
            decode(r#"44{"message":"Not authorized"}"#).unwrap(),
            Packet::ConnectError(json!({ "message": "Not authorized" }))
        );
        assert!(decode("").is_err());
        assert!(decode("5").is_err());
        assert!(decode(r#"42/admin,["x"]"#).is_err());
        assert!(decode("42[1]").is_err());
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode(&Packet::Connect { sid: None }).unwrap(), "40");
        assert_eq!(encode(&Packet::Pong(String::new())).unwrap(), "3");
        assert_eq!(
            encode(&Packet::event("find_match", None)).unwrap(),
            r#"42["find_match"]"#
        );
        assert_eq!(
            encode(&Packet::event("message", Some(json!("hey")))).unwrap(),
            r#"42["message","hey"]"#
        );
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(
            endpoint_url("https://backend.example.org").unwrap().as_str(),
            "wss://backend.example.org/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            endpoint_url("http://127.0.0.1:5001").unwrap().as_str(),
            "ws://127.0.0.1:5001/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            endpoint_url("ws://host/custom/").unwrap().as_str(),
            "ws://host/custom/?EIO=4&transport=websocket"
        );
        assert!(endpoint_url("ftp://host").is_err());
        assert!(endpoint_url("not a url").is_err());
    }
}
