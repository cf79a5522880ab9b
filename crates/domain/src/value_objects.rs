//! 作业键
//!
//! `JobKey` 是一组命名字段到标量值的映射，唯一标识一个工作单元。
//! 字段按名称排序保存，规范化的JSON文本即为注册表主键。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use jobreg_core::config::is_plain_identifier;
use jobreg_errors::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int(i64::from(v))
    }
}

impl From<bool> for KeyValue {
    fn from(v: bool) -> Self {
        KeyValue::Bool(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(v)
    }
}

impl From<&KeyValue> for serde_json::Value {
    fn from(v: &KeyValue) -> Self {
        match v {
            KeyValue::Bool(b) => serde_json::Value::Bool(*b),
            KeyValue::Int(i) => serde_json::Value::from(*i),
            KeyValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(BTreeMap<String, KeyValue>);

impl JobKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&KeyValue> {
        self.0.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &KeyValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 规范化文本形式，作为存储主键
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// 从JSON对象文本解析，例如 `{"subject_id": 1, "session": "a"}`
    pub fn parse(text: &str) -> SchedulerResult<Self> {
        let key: JobKey = serde_json::from_str(text)
            .map_err(|e| SchedulerError::validation_error(format!("无效的作业键 {text}: {e}")))?;
        key.validate()?;
        Ok(key)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.is_empty() {
            return Err(SchedulerError::validation_error("作业键不能为空"));
        }
        if let Some(bad) = self.0.keys().find(|f| !is_plain_identifier(f)) {
            return Err(SchedulerError::validation_error(format!(
                "作业键字段名无效: {bad}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let object: serde_json::Map<String, serde_json::Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
            .collect();
        write!(f, "{}", serde_json::Value::Object(object))
    }
}

impl FromStr for JobKey {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKey::parse(s)
    }
}

impl<K: Into<String>, V: Into<KeyValue>> FromIterator<(K, V)> for JobKey {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        JobKey(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// 部分作业键，用于限定工作集或注册表的范围
///
/// 当记录的键包含限定中的每个字段且取值相等时即匹配。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyRestriction(JobKey);

impl KeyRestriction {
    pub fn new(partial: JobKey) -> SchedulerResult<Self> {
        partial.validate()?;
        Ok(Self(partial))
    }

    pub fn matches(&self, key: &JobKey) -> bool {
        self.0.fields().all(|(field, value)| key.get(field) == Some(value))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &KeyValue)> {
        self.0.fields()
    }
}

impl fmt::Display for KeyRestriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_form_is_field_ordered() {
        let a = JobKey::new().with("subject_id", 1).with("session", "s1");
        let b = JobKey::new().with("session", "s1").with("subject_id", 1);
        assert_eq!(a, b);
        assert_eq!(a.canonical(), r#"{"session":"s1","subject_id":1}"#);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_parse_round_trip() {
        let key = JobKey::parse(r#"{"subject_id": 7, "flag": true, "name": "x"}"#).unwrap();
        assert_eq!(key.get("subject_id"), Some(&KeyValue::Int(7)));
        assert_eq!(key.get("flag"), Some(&KeyValue::Bool(true)));
        assert_eq!(key.get("name"), Some(&KeyValue::Text("x".to_string())));
        assert_eq!(JobKey::parse(&key.canonical()).unwrap(), key);
    }

    #[test]
    fn test_parse_rejects_invalid_keys() {
        assert!(JobKey::parse("{}").is_err());
        assert!(JobKey::parse("[1, 2]").is_err());
        assert!(JobKey::parse(r#"{"x": 1.5}"#).is_err());
        assert!(JobKey::parse(r#"{"bad field": 1}"#).is_err());
    }

    #[test]
    fn test_ordering_is_field_wise() {
        let k1 = JobKey::new().with("id", 1);
        let k2 = JobKey::new().with("id", 2);
        assert!(k1 < k2);
    }

    #[test]
    fn test_restriction_matching() {
        let restriction = KeyRestriction::new(JobKey::new().with("subject_id", 1)).unwrap();
        let inside = JobKey::new().with("subject_id", 1).with("session", 2);
        let outside = JobKey::new().with("subject_id", 2).with("session", 2);
        let missing_field = JobKey::new().with("session", 2);

        assert!(restriction.matches(&inside));
        assert!(!restriction.matches(&outside));
        assert!(!restriction.matches(&missing_field));
    }

    #[test]
    fn test_restriction_requires_fields() {
        assert!(KeyRestriction::new(JobKey::new()).is_err());
    }
}
