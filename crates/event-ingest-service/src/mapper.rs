//! 入站映射器
//!
//! 把一条原始 Kafka 消息 + 同 topic 的候选 Schema 描述符映射为规范化
//! 触发器。与生产方没有编译期耦合：字段全部按注册中心声明的点号路径
//! 提取，路径逐段大小写不敏感；缺失字段走文档化的回退链。
//!
//! 映射失败是"静默丢弃"类故障：返回携带错误码的 `MapFailure`，
//! 由调用方记审计行后提交位点，绝不让单条坏消息卡住消费。

use chrono::{DateTime, Utc};
use loyalty_shared::kafka::ConsumerMessage;
use loyalty_shared::registry::EventSchemaDescriptor;
use loyalty_shared::trigger::Trigger;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// 信封里事件类型判别字段的候选名
const EVENT_TYPE_FIELDS: &[&str] = &["eventType", "event_type", "type"];

/// 用户 ID 的回退路径链（hint 缺失或未命中时依序尝试）
const USER_ID_FALLBACKS: &[&str] = &["userId", "user_id", "subjectId", "subject_id"];

/// 操作 ID 的回退路径链
const OPERATION_ID_FALLBACKS: &[&str] = &["operationId", "operation_id", "eventId", "event_id", "id"];

// ---------------------------------------------------------------------------
// 错误
// ---------------------------------------------------------------------------

/// 映射失败原因
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MapError {
    #[error("负载不是合法 JSON: {0}")]
    InvalidPayload(String),

    #[error("信封声明的事件类型没有匹配的 Schema: {0}")]
    UnknownEventType(String),

    #[error("多个候选 Schema 且信封无判别字段，无法路由")]
    AmbiguousSchema,

    #[error("无法解析出非空的用户 ID")]
    MissingUserId,
}

impl MapError {
    /// 审计行使用的错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::UnknownEventType(_) => "UNKNOWN_EVENT_TYPE",
            Self::AmbiguousSchema => "AMBIGUOUS_SCHEMA",
            Self::MissingUserId => "MISSING_USER_ID",
        }
    }
}

/// 映射失败结果
///
/// 操作 ID 即使在映射失败时也要可用——审计行以 (topic, operation_id)
/// 去重，重投的坏消息不会刷出重复审计行。
#[derive(Debug, Clone)]
pub struct MapFailure {
    pub operation_id: String,
    pub error: MapError,
}

// ---------------------------------------------------------------------------
// 路径提取
// ---------------------------------------------------------------------------

/// 按点号路径取值，逐段大小写不敏感，支持数组数字下标
///
/// 同级同名（仅大小写不同）的键以精确匹配优先。任何一段未命中都
/// 返回 None，不抛错。
pub fn path_get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = match map.get(part) {
                    Some(v) => v,
                    None => map
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(part))
                        .map(|(_, v)| v)?,
                };
            }
            Value::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// 按路径取非空字符串；数字也接受（生产方常把 ID 发成数字）
fn path_get_string(root: &Value, path: &str) -> Option<String> {
    match path_get(root, path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 依序尝试一组路径，返回第一个命中的非空字符串
fn first_string(root: &Value, hint: Option<&str>, fallbacks: &[&str]) -> Option<String> {
    hint.and_then(|p| path_get_string(root, p))
        .or_else(|| fallbacks.iter().find_map(|p| path_get_string(root, p)))
}

// ---------------------------------------------------------------------------
// 操作 ID
// ---------------------------------------------------------------------------

/// 生产方未提供操作 ID 时的确定性回退
///
/// 对 (topic, key, value) 做 SHA-256：字节级相同的重放必得同一 ID，
/// 幂等账本因此对"无 ID 生产方"的重投同样生效。
pub fn fallback_operation_id(topic: &str, key: Option<&str>, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update([0x1f]);
    hasher.update(key.unwrap_or("").as_bytes());
    hasher.update([0x1f]);
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// 解析操作 ID：hint 路径 → 回退字段链 → 确定性哈希
fn resolve_operation_id(envelope: Option<&Value>, hint: Option<&str>, msg: &ConsumerMessage) -> String {
    envelope
        .and_then(|root| first_string(root, hint, OPERATION_ID_FALLBACKS))
        .unwrap_or_else(|| fallback_operation_id(&msg.topic, msg.key.as_deref(), &msg.payload))
}

// ---------------------------------------------------------------------------
// Schema 选择
// ---------------------------------------------------------------------------

/// 在候选集中选择消息对应的 Schema
///
/// 信封带判别字段时按事件类型大小写不敏感匹配；不带判别字段时，
/// 单候选 topic 直接采用，多候选 topic 无法路由（按设计静默失败）。
fn select_schema<'a>(
    candidates: &'a [EventSchemaDescriptor],
    envelope: &Value,
) -> Result<&'a EventSchemaDescriptor, MapError> {
    let declared = EVENT_TYPE_FIELDS
        .iter()
        .find_map(|f| path_get_string(envelope, f));

    if let Some(event_type) = declared {
        return candidates
            .iter()
            .find(|d| d.event_type.eq_ignore_ascii_case(&event_type))
            .ok_or(MapError::UnknownEventType(event_type));
    }

    match candidates {
        [single] => Ok(single),
        _ => Err(MapError::AmbiguousSchema),
    }
}

// ---------------------------------------------------------------------------
// 时间解析
// ---------------------------------------------------------------------------

/// 解析事件发生时间：RFC 3339 字符串或 epoch 毫秒数；
/// 解析不出来回落到接收时间
fn resolve_occurred_at(envelope: &Value, hint: Option<&str>, ingested_at: DateTime<Utc>) -> DateTime<Utc> {
    let Some(path) = hint else {
        return ingested_at;
    };

    match path_get(envelope, path) {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(ingested_at),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(ingested_at),
        _ => ingested_at,
    }
}

// ---------------------------------------------------------------------------
// 映射入口
// ---------------------------------------------------------------------------

/// 把一条原始消息映射为触发器
pub fn map_message(
    candidates: &[EventSchemaDescriptor],
    msg: &ConsumerMessage,
    retain_raw_payload: bool,
    ingested_at: DateTime<Utc>,
) -> Result<Trigger, MapFailure> {
    // 负载解析失败时信封不可用，操作 ID 直接走哈希回退
    let envelope: Value = match serde_json::from_slice(&msg.payload) {
        Ok(v) => v,
        Err(e) => {
            return Err(MapFailure {
                operation_id: resolve_operation_id(None, None, msg),
                error: MapError::InvalidPayload(e.to_string()),
            });
        }
    };

    let schema = match select_schema(candidates, &envelope) {
        Ok(s) => s,
        Err(error) => {
            return Err(MapFailure {
                operation_id: resolve_operation_id(Some(&envelope), None, msg),
                error,
            });
        }
    };

    let operation_id =
        resolve_operation_id(Some(&envelope), schema.hints.operation_id.as_deref(), msg);

    // 用户 ID 必须非空，否则丢弃
    let Some(user_id) = first_string(
        &envelope,
        schema.hints.subject_id.as_deref(),
        USER_ID_FALLBACKS,
    ) else {
        return Err(MapFailure {
            operation_id,
            error: MapError::MissingUserId,
        });
    };

    let occurred_at =
        resolve_occurred_at(&envelope, schema.hints.occurred_at.as_deref(), ingested_at);

    // 元数据逐项尽力提取，缺失的路径直接跳过
    let mut metadata = Map::new();
    for (name, path) in &schema.hints.metadata {
        if let Some(value) = path_get(&envelope, path) {
            metadata.insert(name.clone(), value.clone());
        }
    }

    debug!(
        event_type = %schema.event_type,
        user_id = %user_id,
        operation_id = %operation_id,
        "消息已映射为触发器"
    );

    Ok(Trigger {
        event_type: schema.event_type.clone(),
        user_id,
        operation_id,
        metadata: Value::Object(metadata),
        raw_payload: retain_raw_payload.then_some(envelope),
        source: msg.topic.clone(),
        occurred_at,
    })
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loyalty_shared::registry::FieldHints;
    use serde_json::json;
    use std::collections::HashMap;

    fn descriptor(event_type: &str, hints: FieldHints) -> EventSchemaDescriptor {
        EventSchemaDescriptor {
            event_type: event_type.to_string(),
            topic: "users.user.events".to_string(),
            producer: "user-service".to_string(),
            version: 1,
            hints,
        }
    }

    fn message(payload: Value) -> ConsumerMessage {
        ConsumerMessage {
            topic: "users.user.events".to_string(),
            partition: 0,
            offset: 1,
            key: Some("k-1".to_string()),
            payload: serde_json::to_vec(&payload).unwrap(),
            timestamp: None,
            headers: HashMap::new(),
        }
    }

    fn now() -> DateTime<Utc> {
        "2026-02-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_path_get_case_insensitive() {
        let root = json!({"Payload": {"UserId": "u-1", "items": [{"sku": "a"}]}});

        assert_eq!(path_get(&root, "payload.userid"), Some(&json!("u-1")));
        assert_eq!(path_get(&root, "PAYLOAD.items.0.SKU"), Some(&json!("a")));
        assert_eq!(path_get(&root, "payload.missing"), None);
        assert_eq!(path_get(&root, "payload.userid.deeper"), None);
    }

    #[test]
    fn test_path_get_exact_match_wins() {
        // 同级存在仅大小写不同的键时，精确匹配优先
        let root = json!({"userId": "exact", "userid": "loose"});
        assert_eq!(path_get(&root, "userId"), Some(&json!("exact")));
    }

    #[test]
    fn test_single_candidate_without_discriminator() {
        let candidates = vec![descriptor("users.user.created.v1", FieldHints::default())];
        let msg = message(json!({"userId": "u-1"}));

        let trigger = map_message(&candidates, &msg, false, now()).unwrap();
        assert_eq!(trigger.event_type, "users.user.created.v1");
        assert_eq!(trigger.user_id, "u-1");
        assert_eq!(trigger.source, "users.user.events");
    }

    #[test]
    fn test_discriminator_matches_case_insensitively() {
        let candidates = vec![
            descriptor("users.user.created.v1", FieldHints::default()),
            descriptor("users.user.updated.v1", FieldHints::default()),
        ];
        let msg = message(json!({"eventType": "USERS.USER.UPDATED.V1", "userId": "u-1"}));

        let trigger = map_message(&candidates, &msg, false, now()).unwrap();
        // 事件类型取描述符里的规范写法，不是信封写法
        assert_eq!(trigger.event_type, "users.user.updated.v1");
    }

    #[test]
    fn test_ambiguous_multi_schema_topic_fails() {
        let candidates = vec![
            descriptor("users.user.created.v1", FieldHints::default()),
            descriptor("users.user.updated.v1", FieldHints::default()),
        ];
        let msg = message(json!({"userId": "u-1"}));

        let failure = map_message(&candidates, &msg, false, now()).unwrap_err();
        assert_eq!(failure.error, MapError::AmbiguousSchema);
        assert_eq!(failure.error.code(), "AMBIGUOUS_SCHEMA");
    }

    #[test]
    fn test_unknown_declared_event_type_fails() {
        let candidates = vec![descriptor("users.user.created.v1", FieldHints::default())];
        let msg = message(json!({"eventType": "orders.order.paid.v1", "userId": "u-1"}));

        let failure = map_message(&candidates, &msg, false, now()).unwrap_err();
        assert!(matches!(failure.error, MapError::UnknownEventType(_)));
    }

    #[test]
    fn test_user_id_hint_then_fallbacks() {
        let hints = FieldHints {
            subject_id: Some("payload.actor.id".to_string()),
            ..Default::default()
        };
        let candidates = vec![descriptor("users.user.created.v1", hints)];

        // hint 命中
        let msg = message(json!({"payload": {"actor": {"id": "u-hint"}}}));
        assert_eq!(
            map_message(&candidates, &msg, false, now()).unwrap().user_id,
            "u-hint"
        );

        // hint 未命中，回退到 user_id 字段；数字 ID 也接受
        let msg = message(json!({"user_id": 4242}));
        assert_eq!(
            map_message(&candidates, &msg, false, now()).unwrap().user_id,
            "4242"
        );
    }

    #[test]
    fn test_missing_user_id_drops_message() {
        let candidates = vec![descriptor("users.user.created.v1", FieldHints::default())];
        let msg = message(json!({"something": "else"}));

        let failure = map_message(&candidates, &msg, false, now()).unwrap_err();
        assert_eq!(failure.error, MapError::MissingUserId);
        // 操作 ID 仍然可用于审计行
        assert!(!failure.operation_id.is_empty());
    }

    #[test]
    fn test_empty_user_id_is_missing() {
        let candidates = vec![descriptor("users.user.created.v1", FieldHints::default())];
        let msg = message(json!({"userId": ""}));

        let failure = map_message(&candidates, &msg, false, now()).unwrap_err();
        assert_eq!(failure.error, MapError::MissingUserId);
    }

    #[test]
    fn test_occurred_at_iso_epoch_and_fallback() {
        let hints = FieldHints {
            occurred_at: Some("meta.at".to_string()),
            ..Default::default()
        };
        let candidates = vec![descriptor("users.user.created.v1", hints)];

        // RFC 3339
        let msg = message(json!({"userId": "u-1", "meta": {"at": "2026-01-15T08:30:00+02:00"}}));
        let trigger = map_message(&candidates, &msg, false, now()).unwrap();
        assert_eq!(trigger.occurred_at.to_rfc3339(), "2026-01-15T06:30:00+00:00");

        // epoch 毫秒
        let msg = message(json!({"userId": "u-1", "meta": {"at": 1_768_000_000_000i64}}));
        let trigger = map_message(&candidates, &msg, false, now()).unwrap();
        assert_eq!(trigger.occurred_at.timestamp_millis(), 1_768_000_000_000);

        // 不可解析 → 接收时间
        let msg = message(json!({"userId": "u-1", "meta": {"at": "not-a-date"}}));
        let trigger = map_message(&candidates, &msg, false, now()).unwrap();
        assert_eq!(trigger.occurred_at, now());

        // 缺失 → 接收时间
        let msg = message(json!({"userId": "u-1"}));
        let trigger = map_message(&candidates, &msg, false, now()).unwrap();
        assert_eq!(trigger.occurred_at, now());
    }

    #[test]
    fn test_operation_id_chain() {
        let hints = FieldHints {
            operation_id: Some("meta.opId".to_string()),
            ..Default::default()
        };
        let candidates = vec![descriptor("users.user.created.v1", hints)];

        // hint 命中
        let msg = message(json!({"userId": "u-1", "meta": {"opId": "op-from-hint"}}));
        assert_eq!(
            map_message(&candidates, &msg, false, now()).unwrap().operation_id,
            "op-from-hint"
        );

        // 回退到 eventId
        let msg = message(json!({"userId": "u-1", "eventId": "evt-7"}));
        assert_eq!(
            map_message(&candidates, &msg, false, now()).unwrap().operation_id,
            "evt-7"
        );

        // 全部缺失 → 确定性哈希
        let msg = message(json!({"userId": "u-1"}));
        let trigger = map_message(&candidates, &msg, false, now()).unwrap();
        assert_eq!(
            trigger.operation_id,
            fallback_operation_id(&msg.topic, msg.key.as_deref(), &msg.payload)
        );
    }

    #[test]
    fn test_fallback_operation_id_deterministic() {
        let a = fallback_operation_id("t", Some("k"), b"payload");
        let b = fallback_operation_id("t", Some("k"), b"payload");
        assert_eq!(a, b);

        // 任一输入变化都会改变 ID
        assert_ne!(a, fallback_operation_id("t2", Some("k"), b"payload"));
        assert_ne!(a, fallback_operation_id("t", Some("k2"), b"payload"));
        assert_ne!(a, fallback_operation_id("t", Some("k"), b"payload2"));
        assert_ne!(a, fallback_operation_id("t", None, b"payload"));
    }

    #[test]
    fn test_metadata_best_effort() {
        let hints = FieldHints {
            metadata: HashMap::from([
                ("department".to_string(), "payload.dept".to_string()),
                ("missing".to_string(), "payload.nope".to_string()),
            ]),
            ..Default::default()
        };
        let candidates = vec![descriptor("users.user.created.v1", hints)];
        let msg = message(json!({"userId": "u-1", "payload": {"dept": "engineering"}}));

        let trigger = map_message(&candidates, &msg, false, now()).unwrap();
        assert_eq!(trigger.metadata["department"], "engineering");
        assert!(trigger.metadata.get("missing").is_none());
    }

    #[test]
    fn test_raw_payload_retention_flag() {
        let candidates = vec![descriptor("users.user.created.v1", FieldHints::default())];
        let payload = json!({"userId": "u-1"});

        let kept = map_message(&candidates, &message(payload.clone()), true, now()).unwrap();
        assert_eq!(kept.raw_payload, Some(payload));

        let dropped = map_message(&candidates, &message(json!({"userId": "u-1"})), false, now()).unwrap();
        assert_eq!(dropped.raw_payload, None);
    }

    #[test]
    fn test_invalid_payload() {
        let candidates = vec![descriptor("users.user.created.v1", FieldHints::default())];
        let mut msg = message(json!({}));
        msg.payload = b"{not json".to_vec();

        let failure = map_message(&candidates, &msg, false, now()).unwrap_err();
        assert!(matches!(failure.error, MapError::InvalidPayload(_)));
        assert_eq!(failure.error.code(), "INVALID_PAYLOAD");
        // 哈希回退保证坏消息的重投映射到同一审计键
        assert_eq!(
            failure.operation_id,
            fallback_operation_id(&msg.topic, msg.key.as_deref(), &msg.payload)
        );
    }
}
