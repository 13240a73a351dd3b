//! 处理器自定义载荷在存储边界上的 map 表示

use jobs_core::{JobsError, JobsResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// 存储层看到的载荷形态：字符串键的 JSON 对象
pub type PayloadMap = Map<String, Value>;

/// 把强类型载荷转换为 map，非对象形态（数字、数组、null 等）视为错误
pub fn to_payload_map<T: Serialize>(value: &T) -> JobsResult<PayloadMap> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(JobsError::InvalidHandlerPayload(format!(
            "expected a map-shaped payload, got `{other}`"
        ))),
    }
}

/// 从 map 还原强类型载荷；缺失时返回类型默认值
pub fn from_payload_map<T: DeserializeOwned + Default>(map: Option<&PayloadMap>) -> JobsResult<T> {
    match map {
        None => Ok(T::default()),
        Some(map) => Ok(serde_json::from_value(Value::Object(map.clone()))?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Report {
        pages: u32,
        #[serde(default)]
        title: String,
    }

    #[test]
    fn test_struct_payload_becomes_map() {
        let map = to_payload_map(&Report {
            pages: 3,
            title: "weekly".to_string(),
        })
        .unwrap();
        assert_eq!(map.get("pages"), Some(&Value::from(3)));

        let back: Report = from_payload_map(Some(&map)).unwrap();
        assert_eq!(back.pages, 3);
        assert_eq!(back.title, "weekly");
    }

    #[test]
    fn test_missing_map_yields_default() {
        let report: Report = from_payload_map(None).unwrap();
        assert_eq!(report, Report::default());
    }

    #[test]
    fn test_non_map_payloads_rejected() {
        assert!(matches!(
            to_payload_map(&42u32),
            Err(JobsError::InvalidHandlerPayload(_))
        ));
        assert!(matches!(
            to_payload_map(&()),
            Err(JobsError::InvalidHandlerPayload(_))
        ));
        assert!(to_payload_map(&vec![1, 2]).is_err());
    }

    #[test]
    fn test_mismatched_map_is_serialization_error() {
        let mut map = PayloadMap::new();
        map.insert("pages".to_string(), Value::from("many"));
        let err = from_payload_map::<Report>(Some(&map)).unwrap_err();
        assert!(matches!(err, JobsError::Serialization(_)));
    }
}
