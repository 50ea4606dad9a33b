//! Query parameters accepted by the store and the REST surface.
//!
//! A filtered field holds either a literal or exactly one comparison
//! operator, e.g. `{"id": "5"}` or `{"id": {"greaterOrEqual": "5"}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AccountId, BlobId, CardId, ContextId, MessageId, NotificationId, SocialId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonOperator<T> {
    Less(T),
    LessOrEqual(T),
    Greater(T),
    GreaterOrEqual(T),
    NotEqual(T),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Comparison<T> {
    Operator(ComparisonOperator<T>),
    Literal(T),
}

impl<T> From<T> for Comparison<T> {
    fn from(value: T) -> Self {
        Comparison::Literal(value)
    }
}

impl<T: PartialOrd> Comparison<T> {
    pub fn matches(&self, candidate: &T) -> bool {
        match self {
            Comparison::Literal(v) => candidate == v,
            Comparison::Operator(op) => match op {
                ComparisonOperator::Less(v) => candidate < v,
                ComparisonOperator::LessOrEqual(v) => candidate <= v,
                ComparisonOperator::Greater(v) => candidate > v,
                ComparisonOperator::GreaterOrEqual(v) => candidate >= v,
                ComparisonOperator::NotEqual(v) => candidate != v,
            },
        }
    }
}

impl<T> Comparison<T> {
    pub fn less(v: T) -> Self {
        Self::Operator(ComparisonOperator::Less(v))
    }

    pub fn less_or_equal(v: T) -> Self {
        Self::Operator(ComparisonOperator::LessOrEqual(v))
    }

    pub fn greater(v: T) -> Self {
        Self::Operator(ComparisonOperator::Greater(v))
    }

    pub fn greater_or_equal(v: T) -> Self {
        Self::Operator(ComparisonOperator::GreaterOrEqual(v))
    }

    /// SQL operator and operand.
    pub fn sql_parts(&self) -> (&'static str, &T) {
        match self {
            Comparison::Literal(v) => ("=", v),
            Comparison::Operator(op) => match op {
                ComparisonOperator::Less(v) => ("<", v),
                ComparisonOperator::LessOrEqual(v) => ("<=", v),
                ComparisonOperator::Greater(v) => (">", v),
                ComparisonOperator::GreaterOrEqual(v) => (">=", v),
                ComparisonOperator::NotEqual(v) => ("!=", v),
            },
        }
    }

    /// Inclusive bounds implied by this comparison, when it has any.
    pub fn bounds(&self) -> (Option<&T>, Option<&T>) {
        match self {
            Comparison::Literal(v) => (Some(v), Some(v)),
            Comparison::Operator(op) => match op {
                ComparisonOperator::Less(v) | ComparisonOperator::LessOrEqual(v) => (None, Some(v)),
                ComparisonOperator::Greater(v) | ComparisonOperator::GreaterOrEqual(v) => {
                    (Some(v), None)
                }
                ComparisonOperator::NotEqual(_) => (None, None),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FindMessagesParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<CardId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Comparison<MessageId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<Comparison<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<SocialId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<SortOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl FindMessagesParams {
    pub fn for_card(card: impl Into<CardId>) -> Self {
        Self {
            card: Some(card.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FindMessagesGroupsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<CardId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<BlobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_date: Option<Comparison<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_date: Option<Comparison<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<SortOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Embed notifications into each returned context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedNotifications {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FindNotificationContextsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ContextId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<CardId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<Comparison<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<SortOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<EmbeddedNotifications>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FindNotificationsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NotificationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<CardId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<Comparison<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<SortOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FindCollaboratorsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<CardId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Read operations exposed by the REST request endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    FindMessages,
    FindMessagesMeta,
    FindMessagesGroups,
    FindNotificationContexts,
    FindNotifications,
    FindCollaborators,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::FindMessages,
        Operation::FindMessagesMeta,
        Operation::FindMessagesGroups,
        Operation::FindNotificationContexts,
        Operation::FindNotifications,
        Operation::FindCollaborators,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FindMessages => "findMessages",
            Self::FindMessagesMeta => "findMessagesMeta",
            Self::FindMessagesGroups => "findMessagesGroups",
            Self::FindNotificationContexts => "findNotificationContexts",
            Self::FindNotifications => "findNotifications",
            Self::FindCollaborators => "findCollaborators",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn literal_or_single_operator() {
        let literal: Comparison<MessageId> = serde_json::from_value(json!("5")).unwrap();
        assert_eq!(literal, Comparison::Literal(MessageId(5)));

        let op: Comparison<MessageId> =
            serde_json::from_value(json!({"greaterOrEqual": "5"})).unwrap();
        assert_eq!(op, Comparison::greater_or_equal(MessageId(5)));
        assert!(op.matches(&MessageId(5)));
        assert!(!op.matches(&MessageId(4)));

        let two_ops = serde_json::from_value::<Comparison<MessageId>>(
            json!({"less": "5", "greater": "1"}),
        );
        assert!(two_ops.is_err());
    }

    #[test]
    fn params_round_trip_through_query_string_json() {
        let params = FindMessagesParams {
            card: Some(CardId::from("C1")),
            id: Some(Comparison::less(MessageId(100))),
            order: Some(SortOrder::Descending),
            limit: Some(20),
            ..Default::default()
        };
        let text = serde_json::to_string(&params).unwrap();
        assert!(text.contains("\"less\":\"100\""));
        let back: FindMessagesParams = serde_json::from_str(&text).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn operation_names_match_routes() {
        assert_eq!(Operation::parse("findMessagesGroups"), Some(Operation::FindMessagesGroups));
        assert_eq!(Operation::parse("dropTable"), None);
        for op in Operation::ALL {
            assert_eq!(serde_json::to_value(op).unwrap(), op.as_str());
        }
    }

    #[test]
    fn bounds_from_operators() {
        let c = Comparison::less_or_equal(3);
        assert_eq!(c.bounds(), (None, Some(&3)));
        assert_eq!(Comparison::Literal(2).bounds(), (Some(&2), Some(&2)));
    }
}
