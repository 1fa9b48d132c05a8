//! Channel URI decomposition, driver side
//!
//! The client hands channel URIs to the driver opaquely; only the driver
//! takes them apart. The shape is `bus:<media>?key=value|key=value`, e.g.
//! `bus:mem?endpoint=host:2020|control-mode=manual|tags=1,2`. Host and port
//! are never decomposed here; an endpoint value is an opaque matching key.

use std::collections::HashMap;

use crate::client::command::ControlMode;

/// URI scheme every channel must carry
pub const URI_SCHEME: &str = "bus:";

/// Parsed channel URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    media: String,
    params: HashMap<String, String>,
}

impl ChannelUri {
    /// Parse a channel string; the error text goes into the driver's error
    /// response verbatim
    pub fn parse(channel: &str) -> Result<Self, String> {
        let rest = channel
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| format!("channel must start with '{}': {}", URI_SCHEME, channel))?;

        let (media, query) = match rest.split_once('?') {
            Some((media, query)) => (media, Some(query)),
            None => (rest, None),
        };
        if media.is_empty() {
            return Err(format!("channel has no media: {}", channel));
        }

        let mut params = HashMap::new();
        if let Some(query) = query {
            for pair in query.split('|') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("malformed parameter '{}' in {}", pair, channel))?;
                if key.is_empty() {
                    return Err(format!("empty parameter key in {}", channel));
                }
                params.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            media: media.to_string(),
            params,
        })
    }

    /// Transport media identifier (`mem` for the in-process transport)
    pub fn media(&self) -> &str {
        &self.media
    }

    /// Raw parameter lookup
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// `endpoint` parameter: the opaque key destinations and subscriptions
    /// match on
    pub fn endpoint(&self) -> Option<&str> {
        self.get("endpoint")
    }

    /// `control-mode` parameter resolved to a [`ControlMode`]
    pub fn control_mode(&self) -> Result<ControlMode, String> {
        match self.get("control-mode") {
            None => Ok(ControlMode::None),
            Some("manual") => Ok(ControlMode::Manual),
            Some("dynamic") => Ok(ControlMode::Dynamic),
            Some(other) => Err(format!("unknown control-mode '{}'", other)),
        }
    }

    /// `control` parameter: discovery key for dynamic-mode matching
    pub fn control(&self) -> Option<&str> {
        self.get("control")
    }

    /// `tags` parameter split on commas
    pub fn tags(&self) -> Vec<&str> {
        self.get("tags")
            .map(|tags| tags.split(',').filter(|t| !t.is_empty()).collect())
            .unwrap_or_default()
    }

    /// `fc` parameter naming the flow control strategy
    pub fn flow_control(&self) -> Option<&str> {
        self.get("fc")
    }

    /// `alias` parameter for diagnostics
    pub fn alias(&self) -> Option<&str> {
        self.get("alias")
    }
}

impl std::fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", URI_SCHEME, self.media)?;
        let mut first = true;
        // deterministic order for logs
        let mut keys: Vec<&String> = self.params.keys().collect();
        keys.sort();
        for key in keys {
            let sep = if first { '?' } else { '|' };
            write!(f, "{}{}={}", sep, key, self.params[key])?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri =
            ChannelUri::parse("bus:mem?endpoint=localhost:24326|control-mode=manual|tags=3,4")
                .unwrap();
        assert_eq!(uri.media(), "mem");
        assert_eq!(uri.endpoint(), Some("localhost:24326"));
        assert_eq!(uri.control_mode().unwrap(), ControlMode::Manual);
        assert_eq!(uri.tags(), vec!["3", "4"]);
        assert_eq!(uri.control(), None);
    }

    #[test]
    fn test_parse_media_only() {
        let uri = ChannelUri::parse("bus:mem").unwrap();
        assert_eq!(uri.media(), "mem");
        assert_eq!(uri.endpoint(), None);
        assert_eq!(uri.control_mode().unwrap(), ControlMode::None);
        assert!(uri.tags().is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(ChannelUri::parse("mem?endpoint=a").is_err());
        assert!(ChannelUri::parse("bus:").is_err());
        assert!(ChannelUri::parse("bus:mem?endpoint").is_err());
        assert!(ChannelUri::parse("bus:mem?=value").is_err());
    }

    #[test]
    fn test_unknown_control_mode_is_error() {
        let uri = ChannelUri::parse("bus:mem?control-mode=tagged").unwrap();
        assert!(uri.control_mode().is_err());
    }

    #[test]
    fn test_display_round_trips_params() {
        let uri = ChannelUri::parse("bus:mem?endpoint=e1|control-mode=manual").unwrap();
        let text = uri.to_string();
        let reparsed = ChannelUri::parse(&text).unwrap();
        assert_eq!(uri, reparsed);
    }
}
