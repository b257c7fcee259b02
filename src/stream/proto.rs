use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Change kinds a subscription can be filtered to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionEvent {
    Create,
    Update,
    Delete,
}

/// Every payload kind a subscription stream can yield.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Init,
    Create,
    Update,
    Delete,
}

impl PayloadKind {
    fn parse(event: &str) -> Option<Self> {
        match event {
            "init" => Some(Self::Init),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Returns `true` when a subscription filtered to `filter` accepts this
    /// kind. `init` always passes.
    pub fn passes(self, filter: Option<SubscriptionEvent>) -> bool {
        match (self, filter) {
            (_, None) | (Self::Init, _) => true,
            (Self::Create, Some(SubscriptionEvent::Create))
            | (Self::Update, Some(SubscriptionEvent::Update))
            | (Self::Delete, Some(SubscriptionEvent::Delete)) => true,
            _ => false,
        }
    }
}

/// Primary key of a deleted item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ItemId {
    Number(i64),
    String(String),
}

/// One subscription message: exactly one payload kind.
///
/// `delete` only ever carries identifiers, never full items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPayload<T> {
    Init(Vec<T>),
    Create(Vec<T>),
    Update(Vec<T>),
    Delete(Vec<ItemId>),
}

impl<T> SubscriptionPayload<T> {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Init(_) => PayloadKind::Init,
            Self::Create(_) => PayloadKind::Create,
            Self::Update(_) => PayloadKind::Update,
            Self::Delete(_) => PayloadKind::Delete,
        }
    }

    /// Converts item payloads with `convert`, leaving delete identifiers as
    /// they are.
    pub fn try_map<U, E, F>(self, mut convert: F) -> Result<SubscriptionPayload<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        let items = |list: Vec<T>, convert: &mut F| {
            list.into_iter().map(convert).collect::<Result<Vec<U>, E>>()
        };
        Ok(match self {
            Self::Init(list) => SubscriptionPayload::Init(items(list, &mut convert)?),
            Self::Create(list) => SubscriptionPayload::Create(items(list, &mut convert)?),
            Self::Update(list) => SubscriptionPayload::Update(items(list, &mut convert)?),
            Self::Delete(ids) => SubscriptionPayload::Delete(ids),
        })
    }
}

/// Error body attached to auth and subscription error frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        #[serde(skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        email: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Subscribe {
        collection: String,
        uid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        query: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<SubscriptionEvent>,
    },
    Unsubscribe {
        uid: String,
    },
    Ping,
    Pong,
}

/// Raw `subscription` frame as received.
///
/// Servers send either one payload key (`init`/`create`/`update`/`delete`)
/// or the `event` + `data` pair; `event: "error"` carries `error` instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubscriptionFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<Vec<ItemId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Decoded content of a [`SubscriptionFrame`].
#[derive(Debug, Clone, PartialEq)]
pub enum FrameContent {
    Payload(SubscriptionPayload<Value>),
    Error(ErrorDetail),
}

impl SubscriptionFrame {
    /// Extracts the single payload carried by this frame.
    ///
    /// Returns a description of the anomaly when the frame carries no
    /// payload, more than one, or an undecodable `event`/`data` pair.
    pub fn into_content(self) -> Result<FrameContent, String> {
        let SubscriptionFrame {
            init,
            create,
            update,
            delete,
            event,
            data,
            error,
            ..
        } = self;

        let mut keyed = [
            init.map(SubscriptionPayload::Init),
            create.map(SubscriptionPayload::Create),
            update.map(SubscriptionPayload::Update),
            delete.map(SubscriptionPayload::Delete),
        ]
        .into_iter()
        .flatten();

        if let Some(payload) = keyed.next() {
            if keyed.next().is_some() {
                return Err("subscription frame carries more than one payload kind".to_string());
            }
            return Ok(FrameContent::Payload(payload));
        }

        let Some(event) = event else {
            return Err("subscription frame carries no payload".to_string());
        };
        if event == "error" {
            return Ok(FrameContent::Error(error.unwrap_or_default()));
        }

        let kind = PayloadKind::parse(&event)
            .ok_or_else(|| format!("unknown subscription event `{event}`"))?;
        let data = data.unwrap_or(Value::Array(Vec::new()));
        let payload = match kind {
            PayloadKind::Delete => {
                SubscriptionPayload::Delete(decode_list(data, &event)?)
            }
            PayloadKind::Init => SubscriptionPayload::Init(decode_list(data, &event)?),
            PayloadKind::Create => SubscriptionPayload::Create(decode_list(data, &event)?),
            PayloadKind::Update => SubscriptionPayload::Update(decode_list(data, &event)?),
        };
        Ok(FrameContent::Payload(payload))
    }
}

fn decode_list<T>(data: Value, event: &str) -> Result<Vec<T>, String>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(data).map_err(|err| format!("invalid `{event}` data: {err}"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscription(SubscriptionFrame),
    Auth {
        status: AuthStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorDetail>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
    },
    Ping,
    Pong,
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subscribe_command_omits_unset_fields() {
        let msg = ClientMessage::Subscribe {
            collection: "messages".to_string(),
            uid: "7".to_string(),
            query: None,
            event: None,
        };
        let encoded: Value = serde_json::from_str(&msg.to_text().expect("encode")).expect("json");
        assert_eq!(
            encoded,
            json!({"type": "subscribe", "collection": "messages", "uid": "7"})
        );
    }

    #[test]
    fn subscribe_command_embeds_query_and_event() {
        let msg = ClientMessage::Subscribe {
            collection: "articles".to_string(),
            uid: "a".to_string(),
            query: Some(json!({"fields": ["id", "title"]})),
            event: Some(SubscriptionEvent::Update),
        };
        let encoded: Value = serde_json::from_str(&msg.to_text().expect("encode")).expect("json");
        assert_eq!(encoded["event"], "update");
        assert_eq!(encoded["query"]["fields"][1], "title");
        assert_eq!(ClientMessage::from_text(&msg.to_text().expect("encode")).expect("decode"), msg);
    }

    #[test]
    fn heartbeat_and_unsubscribe_wire_shapes() {
        assert_eq!(ClientMessage::Ping.to_text().expect("encode"), r#"{"type":"ping"}"#);
        assert_eq!(ClientMessage::Pong.to_text().expect("encode"), r#"{"type":"pong"}"#);
        assert_eq!(
            ClientMessage::Unsubscribe { uid: "x".to_string() }
                .to_text()
                .expect("encode"),
            r#"{"type":"unsubscribe","uid":"x"}"#
        );
    }

    #[test]
    fn keyed_subscription_frame_decodes_single_payload() {
        let msg = ServerMessage::from_text(
            r#"{"type":"subscription","uid":"x","create":[{"id":1}]}"#,
        )
        .expect("decode");
        let ServerMessage::Subscription(frame) = msg else {
            panic!("expected subscription frame");
        };
        assert_eq!(frame.uid.as_deref(), Some("x"));
        assert_eq!(
            frame.into_content().expect("content"),
            FrameContent::Payload(SubscriptionPayload::Create(vec![json!({"id": 1})]))
        );
    }

    #[test]
    fn event_data_form_decodes_delete_identifiers() {
        let msg = ServerMessage::from_text(
            r#"{"type":"subscription","uid":"x","event":"delete","data":[1,"two"]}"#,
        )
        .expect("decode");
        let ServerMessage::Subscription(frame) = msg else {
            panic!("expected subscription frame");
        };
        assert_eq!(
            frame.into_content().expect("content"),
            FrameContent::Payload(SubscriptionPayload::Delete(vec![
                ItemId::Number(1),
                ItemId::String("two".to_string()),
            ]))
        );
    }

    #[test]
    fn error_event_yields_error_detail() {
        let frame = SubscriptionFrame {
            uid: Some("x".to_string()),
            event: Some("error".to_string()),
            error: Some(ErrorDetail {
                code: "FORBIDDEN".to_string(),
                message: "no access".to_string(),
            }),
            ..SubscriptionFrame::default()
        };
        assert_eq!(
            frame.into_content().expect("content"),
            FrameContent::Error(ErrorDetail {
                code: "FORBIDDEN".to_string(),
                message: "no access".to_string(),
            })
        );
    }

    #[test]
    fn frame_with_two_payload_kinds_is_an_anomaly() {
        let frame = SubscriptionFrame {
            create: Some(vec![json!({"id": 1})]),
            delete: Some(vec![ItemId::Number(1)]),
            ..SubscriptionFrame::default()
        };
        assert!(frame.into_content().is_err());
        assert!(SubscriptionFrame::default().into_content().is_err());
    }

    #[test]
    fn auth_frames_decode() {
        assert_eq!(
            ServerMessage::from_text(r#"{"type":"auth","status":"ok"}"#).expect("decode"),
            ServerMessage::Auth {
                status: AuthStatus::Ok,
                error: None,
                refresh_token: None,
            }
        );
        let rejected = ServerMessage::from_text(
            r#"{"type":"auth","status":"error","error":{"code":"INVALID_CREDENTIALS","message":"bad"}}"#,
        )
        .expect("decode");
        assert!(matches!(
            rejected,
            ServerMessage::Auth { status: AuthStatus::Error, error: Some(ref detail), .. }
                if detail.code == "INVALID_CREDENTIALS"
        ));
    }

    #[test]
    fn payload_filter_always_passes_init() {
        assert!(PayloadKind::Init.passes(Some(SubscriptionEvent::Create)));
        assert!(PayloadKind::Create.passes(Some(SubscriptionEvent::Create)));
        assert!(!PayloadKind::Delete.passes(Some(SubscriptionEvent::Create)));
        assert!(PayloadKind::Delete.passes(None));
    }

    #[test]
    fn try_map_converts_items_and_keeps_ids() {
        let payload: SubscriptionPayload<Value> = SubscriptionPayload::Update(vec![json!(3)]);
        let mapped: SubscriptionPayload<u8> = payload
            .try_map(serde_json::from_value)
            .expect("convert");
        assert_eq!(mapped, SubscriptionPayload::Update(vec![3]));

        let deleted: SubscriptionPayload<Value> =
            SubscriptionPayload::Delete(vec![ItemId::Number(9)]);
        let mapped: SubscriptionPayload<u8> = deleted
            .try_map(serde_json::from_value)
            .expect("convert");
        assert_eq!(mapped, SubscriptionPayload::Delete(vec![ItemId::Number(9)]));
    }
}
