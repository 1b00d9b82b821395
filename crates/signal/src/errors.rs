use serde_json::Value;

use chorus_protocol::{ErrorCode, RpcError};

/// Validate one required request field. Returns the matching rejection when
/// the field is missing, null, or an empty string; objects (`jsep`, `minfo`)
/// only need to be present.
pub fn invalid(data: &Value, key: &str) -> Option<RpcError> {
    let missing = match data.get(key) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    };
    if !missing {
        return None;
    }
    let code = match key {
        "uid" => ErrorCode::Uid,
        "rid" => ErrorCode::Rid,
        "mid" => ErrorCode::Mid,
        "sid" => ErrorCode::Sid,
        "jsep" => ErrorCode::Jsep,
        "sdp" => ErrorCode::Sdp,
        "minfo" => ErrorCode::Minfo,
        _ => ErrorCode::Unknown,
    };
    Some(code.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_rid_rejects_with_code_2() {
        let err = invalid(&json!({}), "rid").unwrap();
        assert_eq!(err.code, 2);
        assert_eq!(err.reason, "rid not found");
    }

    #[test]
    fn empty_string_counts_as_missing() {
        assert_eq!(invalid(&json!({"mid": ""}), "mid").unwrap().code, 3);
        assert!(invalid(&json!({"mid": "u1#abc123"}), "mid").is_none());
    }

    #[test]
    fn missing_jsep_rejects_with_code_5() {
        assert_eq!(invalid(&json!({"rid": "r1"}), "jsep").unwrap().code, 5);
        assert_eq!(invalid(&json!({"jsep": null}), "jsep").unwrap().code, 5);
        assert!(invalid(&json!({"jsep": {"type": "offer", "sdp": "v=0"}}), "jsep").is_none());
    }

    #[test]
    fn unknown_key_maps_to_unknown_code() {
        assert_eq!(invalid(&json!({}), "whatever").unwrap().code, 14);
    }
}
