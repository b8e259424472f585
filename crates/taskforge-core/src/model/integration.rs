// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration rows: webhook matchers and value extraction rules.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::task::TaskParams;

/// Where a matcher looks for its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherType {
    Body,
    Header,
}

/// Comparison method applied by a matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Equals,
    Contains,
    Regex,
    BeginsWith,
    EndsWith,
}

/// How a request body is interpreted before key lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyDataType {
    #[default]
    Json,
    String,
    Xml,
}

/// Where an extract value reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Body,
    Header,
}

/// What an extracted value becomes on the seeded task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    /// Merged into the task's environment JSON.
    #[default]
    Environment,
    /// Merged into the task's parameter map.
    TaskParam,
}

/// A persisted rule that materializes tasks on an inbound webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub template_id: i64,
    #[serde(default)]
    pub task_params: Option<TaskParams>,
    /// Secret used to authenticate callers; resolution is external.
    #[serde(default)]
    pub auth_secret_id: Option<i64>,
    #[serde(default)]
    pub searchable: bool,
}

/// A boolean predicate over an incoming request. The integration fires
/// iff every matcher evaluates true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationMatcher {
    pub id: i64,
    pub integration_id: i64,
    pub name: String,
    pub match_type: MatcherType,
    pub method: MatchMethod,
    /// Interpretation of the body during lookup; ignored for headers.
    #[serde(default)]
    pub body_data_type: BodyDataType,
    /// Header name or dotted body key path.
    pub key: String,
    /// Literal the designated value is compared against.
    pub value: String,
}

/// A rule deriving one variable from an incoming request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationExtractValue {
    pub id: i64,
    pub integration_id: i64,
    pub name: String,
    pub value_source: ValueSource,
    #[serde(default)]
    pub body_data_type: BodyDataType,
    /// Header name or dotted body key path; ignored in string mode.
    #[serde(default)]
    pub key: String,
    /// Target variable name.
    pub variable: String,
    #[serde(default)]
    pub variable_type: VariableType,
}

/// Opaque token routing `POST /integrations/{alias}` to an integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationAlias {
    pub id: i64,
    pub project_id: i64,
    pub integration_id: i64,
    pub alias: String,
}

/// 16-hex random token generated on integration creation.
pub fn generate_alias() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| std::char::from_digit(rng.gen_range(0..16u32), 16).unwrap_or('0'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_alias_shape() {
        let alias = generate_alias();
        assert_eq!(alias.len(), 16);
        assert!(alias.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_alias_is_random() {
        assert_ne!(generate_alias(), generate_alias());
    }

    #[test]
    fn test_matcher_deserializes() {
        let matcher: IntegrationMatcher = serde_json::from_str(
            r#"{
                "id": 1,
                "integration_id": 2,
                "name": "push hook",
                "match_type": "body",
                "method": "equals",
                "body_data_type": "json",
                "key": "hook_id",
                "value": "4856239453"
            }"#,
        )
        .unwrap();
        assert_eq!(matcher.match_type, MatcherType::Body);
        assert_eq!(matcher.method, MatchMethod::Equals);
        assert_eq!(matcher.body_data_type, BodyDataType::Json);
    }

    #[test]
    fn test_extract_value_defaults() {
        let value: IntegrationExtractValue = serde_json::from_str(
            r#"{
                "id": 1,
                "integration_id": 2,
                "name": "branch",
                "value_source": "body",
                "key": "ref",
                "variable": "BRANCH_NAME"
            }"#,
        )
        .unwrap();
        assert_eq!(value.body_data_type, BodyDataType::Json);
        assert_eq!(value.variable_type, VariableType::Environment);
    }
}
