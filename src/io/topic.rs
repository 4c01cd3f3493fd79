//! Gateway topic parsing
//!
//! Two layouts live under the configured prefix:
//! - legacy: `<prefix>/<gatewayMAC>/<kind?>`
//! - hierarchical: `<prefix>/<tenant>/<building>/<floor>/gateway/<gatewayID>/<kind?>`

/// What a gateway says it is publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Heartbeat; only refreshes liveness
    Status,
    /// Tag readings
    Detection,
    /// Any other suffix, still counts as gateway traffic
    Other(String),
}

impl MessageKind {
    fn classify(segment: &str) -> Self {
        match segment.to_ascii_lowercase().as_str() {
            "status" | "heartbeat" => MessageKind::Status,
            "beacon" | "detection" | "detections" | "readings" => MessageKind::Detection,
            _ => MessageKind::Other(segment.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayTopic {
    pub tenant: Option<String>,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub gateway_id: String,
    pub kind: Option<MessageKind>,
    pub is_new_format: bool,
}

impl GatewayTopic {
    /// Whether the payload should be run through the detection decoder
    pub fn may_carry_detections(&self) -> bool {
        matches!(self.kind, None | Some(MessageKind::Detection))
    }
}

#[derive(Debug, Clone)]
pub struct TopicParser {
    prefix: String,
}

impl TopicParser {
    /// Build a parser from the MQTT subscription filter
    /// (`rtls/gateways/#` -> prefix `rtls/gateways`)
    pub fn from_filter(filter: &str) -> Self {
        let prefix = filter
            .strip_suffix("/#")
            .or_else(|| filter.strip_suffix("/+"))
            .unwrap_or(filter);
        let prefix = if prefix == "#" || prefix == "+" { "" } else { prefix };
        Self { prefix: prefix.trim_end_matches('/').to_string() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `None` when the topic is not a gateway topic
    pub fn parse(&self, topic: &str) -> Option<GatewayTopic> {
        let rest = if self.prefix.is_empty() {
            topic
        } else {
            topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?
        };

        let segments: Vec<&str> = rest.split('/').collect();

        if segments.len() >= 5 && segments[3].eq_ignore_ascii_case("gateway") {
            let gateway_id = segments[4].trim();
            if gateway_id.is_empty() {
                return None;
            }
            return Some(GatewayTopic {
                tenant: non_empty(segments[0]),
                building: non_empty(segments[1]),
                floor: non_empty(segments[2]),
                gateway_id: gateway_id.to_string(),
                kind: segments.get(5).filter(|s| !s.is_empty()).map(|s| MessageKind::classify(s)),
                is_new_format: true,
            });
        }

        let gateway_id = segments[0].trim();
        if gateway_id.is_empty() {
            return None;
        }
        Some(GatewayTopic {
            tenant: None,
            building: None,
            floor: None,
            gateway_id: gateway_id.to_string(),
            kind: segments.get(1).filter(|s| !s.is_empty()).map(|s| MessageKind::classify(s)),
            is_new_format: false,
        })
    }
}

fn non_empty(segment: &str) -> Option<String> {
    let trimmed = segment.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
