//! Wire vocabulary shared by every transport.
//!
//! All three channels (socket, parent frame, worker bridge) are normalized to
//! [`Message`] before anything upstream sees them. Text payloads are JSON
//! objects tagged by a `type` field; binary socket frames are MessagePack maps
//! (named fields) decoded into [`BinaryFrame`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Tag of binary frames that carry an image for a component.
pub const IMAGE_UPDATE: &str = "image_update";

/// Child keys followed when walking a component tree.
const NESTED_KEYS: [&str; 2] = ["rows", "children"];

/// A message crossing the transport boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Full snapshot of component values. Replaces the local cache.
    InitialState {
        #[serde(default)]
        states: Map<String, Value>,
    },
    StateUpdate {
        component_id: String,
        #[serde(default)]
        value: Value,
    },
    /// The component tree consumed by the rendering layer.
    Components { components: ComponentTree },
    /// Outbound only: ask the peer to apply these values.
    ComponentUpdate { states: Map<String, Value> },
    ConnectionsUpdate {
        #[serde(default)]
        connections: Vec<Value>,
    },
    /// Synthesized locally when connectivity flips.
    ConnectionStatus { connected: bool },
    Error { content: ErrorContent },
    ImageUpdate {
        component_id: String,
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// Page configuration (title, branding, ...). Passed through untouched.
    Config(Map<String, Value>),
    /// Any payload whose `type` is not part of the vocabulary.
    #[serde(skip)]
    Unknown { kind: String, payload: Value },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Message {
    /// Parse a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Validate an already-decoded payload.
    ///
    /// Unrecognized `type`s become [`Message::Unknown`] instead of an error so
    /// newer peers do not break older clients.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !is_known_kind(&kind) {
            return Ok(Message::Unknown {
                kind,
                payload: value,
            });
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        if let Message::Unknown { payload, .. } = self {
            return Ok(payload.to_string());
        }
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.kind().to_string(),
            reason: e.to_string(),
        })
    }

    /// The `type` tag of this message.
    pub fn kind(&self) -> &str {
        match self {
            Message::InitialState { .. } => "initial_state",
            Message::StateUpdate { .. } => "state_update",
            Message::Components { .. } => "components",
            Message::ComponentUpdate { .. } => "component_update",
            Message::ConnectionsUpdate { .. } => "connections_update",
            Message::ConnectionStatus { .. } => "connection_status",
            Message::Error { .. } => "error",
            Message::ImageUpdate { .. } => IMAGE_UPDATE,
            Message::Config(_) => "config",
            Message::Unknown { kind, .. } => kind,
        }
    }

    pub fn component_update(id: impl Into<String>, value: Value) -> Self {
        let mut states = Map::new();
        states.insert(id.into(), value);
        Message::ComponentUpdate { states }
    }

    pub fn error(message: impl Into<String>, context: Option<String>) -> Self {
        Message::Error {
            content: ErrorContent {
                message: message.into(),
                context,
            },
        }
    }
}

fn is_known_kind(kind: &str) -> bool {
    matches!(
        kind,
        "initial_state"
            | "state_update"
            | "components"
            | "component_update"
            | "connections_update"
            | "connection_status"
            | "error"
            | IMAGE_UPDATE
            | "config"
    )
}

/// Component tree as produced by the remote peer: `{ rows: [[component, ...], ...] }`.
///
/// Components are kept as raw JSON; only `id` and `value` matter to the
/// transport layer, everything else belongs to the renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentTree {
    #[serde(default)]
    pub rows: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ComponentTree {
    pub fn new(rows: Vec<Value>) -> Self {
        Self {
            rows,
            extra: Map::new(),
        }
    }

    /// Every `(id, value)` pair found in the tree, in document order.
    ///
    /// Only objects carrying both an `id` string and a `value` key count.
    pub fn component_values(&self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        for row in &self.rows {
            collect_values(row, &mut out);
        }
        out
    }

    /// Fill in `component-{row}-{column}` ids for top-level components that
    /// arrived without one.
    pub fn with_positional_ids(mut self) -> Self {
        for (row_idx, row) in self.rows.iter_mut().enumerate() {
            match row {
                Value::Array(items) => {
                    for (col_idx, item) in items.iter_mut().enumerate() {
                        assign_positional_id(item, row_idx, col_idx);
                    }
                }
                other => assign_positional_id(other, row_idx, 0),
            }
        }
        self
    }
}

fn collect_values(node: &Value, out: &mut Vec<(String, Value)>) {
    match node {
        Value::Array(items) => {
            for item in items {
                collect_values(item, out);
            }
        }
        Value::Object(obj) => {
            if let (Some(id), Some(value)) = (obj.get("id").and_then(Value::as_str), obj.get("value"))
            {
                out.push((id.to_string(), value.clone()));
            }
            for key in NESTED_KEYS {
                if let Some(child) = obj.get(key) {
                    collect_values(child, out);
                }
            }
        }
        _ => {}
    }
}

fn assign_positional_id(item: &mut Value, row: usize, col: usize) {
    if let Value::Object(obj) = item {
        if !obj.contains_key("id") {
            obj.insert(
                "id".to_string(),
                Value::String(format!("component-{row}-{col}")),
            );
        }
    }
}

/// Binary socket frame.
///
/// Only `type` is required. Fields of other frame kinds are ignored so the
/// kind can always be inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default, with = "serde_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub label: Option<String>,
}

impl BinaryFrame {
    pub fn png(component_id: impl Into<String>, data: Vec<u8>, label: Option<String>) -> Self {
        Self {
            kind: IMAGE_UPDATE.to_string(),
            format: Some("png".to_string()),
            component_id: Some(component_id.into()),
            data,
            label,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::InvalidBinary(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec_named(self).map_err(|e| ProtocolError::InvalidBinary(e.to_string()))
    }

    /// Turn a PNG image frame into an `image_update` message.
    ///
    /// Returns `None` for any other frame shape, including image frames whose
    /// `format` is not `png` or that lack a component id.
    pub fn into_image_update(self) -> Option<Message> {
        if self.kind != IMAGE_UPDATE || self.format.as_deref() != Some("png") {
            return None;
        }
        let component_id = self.component_id?;
        Some(Message::ImageUpdate {
            component_id,
            value: png_data_uri(&self.data),
            label: self.label,
        })
    }
}

pub fn png_data_uri(bytes: &[u8]) -> String {
    format!("data:image/png;base64,{}", BASE64.encode(bytes))
}
