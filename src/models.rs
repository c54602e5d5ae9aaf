use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// The capacity a logical account is acting in. One account may hold several
/// roles in the same browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Customer,
    Provider,
    Admin,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Customer => "customer",
            UserType::Provider => "provider",
            UserType::Admin => "admin",
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownUserType(pub String);

impl fmt::Display for UnknownUserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown user type: {}", self.0)
    }
}

impl std::error::Error for UnknownUserType {}

impl FromStr for UserType {
    type Err = UnknownUserType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(UserType::Customer),
            "provider" => Ok(UserType::Provider),
            "admin" => Ok(UserType::Admin),
            other => Err(UnknownUserType(other.to_string())),
        }
    }
}

/// A push token issued to one browser installation, plus descriptive metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToken {
    pub token: String,
    pub device_id: String,
    pub platform: String,
    pub browser: String,
    pub user_agent: String,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
}

/// One logical user/role registered against a device token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSubscription {
    pub user_id: String,
    pub user_type: UserType,
    #[serde(default)]
    pub active_session_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
}

impl UserSubscription {
    pub fn matches(&self, user_id: &str, user_type: Option<UserType>) -> bool {
        self.user_id == user_id && user_type.map_or(true, |t| t == self.user_type)
    }
}

/// Who a notification is aimed at. Derived from the optional target fields
/// of a request or an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    User {
        user_id: String,
        user_type: Option<UserType>,
    },
    Role(UserType),
    Broadcast,
}

impl Target {
    pub fn from_parts(user_id: Option<&str>, user_type: Option<UserType>) -> Self {
        match (user_id.filter(|id| !id.is_empty()), user_type) {
            (Some(user_id), user_type) => Target::User {
                user_id: user_id.to_string(),
                user_type,
            },
            (None, Some(user_type)) => Target::Role(user_type),
            (None, None) => Target::Broadcast,
        }
    }
}

/// Body of `POST /send`. Absence of both target fields means broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_type: Option<UserType>,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_action: Option<String>,
}

impl NotificationRequest {
    pub fn target(&self) -> Target {
        Target::from_parts(self.target_user_id.as_deref(), self.target_user_type)
    }
}

/// String-keyed push data. The recognized keys are lifted into fields; any
/// other key passes through in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationData {
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "userType", default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "clickAction", default, skip_serializing_if = "Option::is_none")]
    pub click_action: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, String>,
}

impl NotificationData {
    pub fn from_map(mut map: HashMap<String, String>) -> Self {
        Self {
            user_id: map.remove("userId"),
            user_type: map.remove("userType"),
            kind: map.remove("type"),
            click_action: map.remove("clickAction"),
            extra: map,
        }
    }

    pub fn into_map(self) -> HashMap<String, String> {
        let mut map = self.extra;
        let known = [
            ("userId", self.user_id),
            ("userType", self.user_type),
            ("type", self.kind),
            ("clickAction", self.click_action),
        ];
        for (key, value) in known {
            if let Some(value) = value {
                map.insert(key.to_string(), value);
            }
        }
        map
    }

    pub fn has_target(&self) -> bool {
        self.user_id.as_deref().is_some_and(|id| !id.is_empty())
            || self.user_type.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// A push message as it reaches a browser context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundPush {
    pub message_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub data: NotificationData,
}

impl InboundPush {
    /// Builds an inbound message from a data-only push, where title and body
    /// travel inside the data map.
    pub fn from_push_data(message_id: impl Into<String>, mut data: HashMap<String, String>) -> Self {
        let title = data.remove("title");
        let body = data.remove("body");
        Self {
            message_id: message_id.into(),
            title,
            body,
            data: NotificationData::from_map(data),
        }
    }
}

/// Per-send aggregate, as reported by `POST /send`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResults {
    pub success_count: usize,
    pub failure_count: usize,
}

// Wire bodies of the registration endpoints.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub device_token: DeviceToken,
    pub user_subscription: UserSubscription,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterRequest {
    pub token: String,
    pub user_id: String,
    pub user_type: UserType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub success: bool,
    pub results: SendResults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_parts() {
        assert_eq!(Target::from_parts(None, None), Target::Broadcast);
        assert_eq!(
            Target::from_parts(None, Some(UserType::Provider)),
            Target::Role(UserType::Provider)
        );
        assert_eq!(
            Target::from_parts(Some("u1"), Some(UserType::Customer)),
            Target::User {
                user_id: "u1".to_string(),
                user_type: Some(UserType::Customer)
            }
        );
        // An empty id is treated as absent
        assert_eq!(Target::from_parts(Some(""), None), Target::Broadcast);
    }

    #[test]
    fn test_notification_data_keeps_unknown_keys() {
        let mut map = HashMap::new();
        map.insert("userId".to_string(), "u1".to_string());
        map.insert("type".to_string(), "booking_confirmed".to_string());
        map.insert("bookingId".to_string(), "b-42".to_string());

        let data = NotificationData::from_map(map.clone());
        assert_eq!(data.user_id.as_deref(), Some("u1"));
        assert_eq!(data.kind.as_deref(), Some("booking_confirmed"));
        assert_eq!(data.extra.get("bookingId").map(String::as_str), Some("b-42"));
        assert!(data.has_target());

        assert_eq!(data.into_map(), map);
    }

    #[test]
    fn test_send_request_wire_format() {
        let req: NotificationRequest = serde_json::from_value(serde_json::json!({
            "targetUserType": "provider",
            "title": "New booking",
            "body": "You have a new repair request",
            "data": { "bookingId": "b-1", "amount": 1200 }
        }))
        .unwrap();

        assert_eq!(req.target(), Target::Role(UserType::Provider));
        assert_eq!(req.data.as_ref().map(|d| d.len()), Some(2));
    }

    #[test]
    fn test_inbound_push_from_data_only_message() {
        let mut data = HashMap::new();
        data.insert("title".to_string(), "Repair finished".to_string());
        data.insert("body".to_string(), "Pick up your phone".to_string());
        data.insert("userType".to_string(), "customer".to_string());

        let push = InboundPush::from_push_data("msg-1", data);
        assert_eq!(push.title.as_deref(), Some("Repair finished"));
        assert_eq!(push.data.user_type.as_deref(), Some("customer"));
        assert!(push.data.extra.is_empty());
    }

    #[test]
    fn test_unknown_user_type_is_rejected() {
        assert!("guest".parse::<UserType>().is_err());
        assert_eq!("admin".parse::<UserType>(), Ok(UserType::Admin));
    }
}
