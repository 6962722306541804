//! RPC verbs and payloads. Two coordination verbs (`request-work`,
//! `send-results`) and the replication verbs the store handle rides on.
//! Bodies are UTF-8 JSON read by field name; unknown fields are tolerated.

use serde::{Deserialize, Serialize};

use crate::job::EncodeOpts;

/// Current protocol version. Sent in the transport handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Verb names dispatched on by the RPC channel.
pub mod verbs {
    pub const REQUEST_WORK: &str = "request-work";
    pub const SEND_RESULTS: &str = "send-results";
    pub const STORE_GET: &str = "store-get";
    pub const STORE_LIST: &str = "store-list";
    pub const STORE_SYNC: &str = "store-sync";
}

/// Signal a pool sends when the available set is exhausted. Not an error:
/// callers must treat it as a normal end-of-work condition.
pub const NO_WORK: &str = "no-work";

/// `request-work` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub drive_key: String,
}

/// `request-work` reply: an assignment, or `{"error":"no-work"}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encode_opts: Option<EncodeOpts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkReply {
    pub fn assignment(segment: impl Into<String>, encode_opts: Option<EncodeOpts>) -> Self {
        WorkReply {
            segment: Some(segment.into()),
            encode_opts,
            error: None,
        }
    }

    pub fn no_work() -> Self {
        WorkReply {
            segment: None,
            encode_opts: None,
            error: Some(NO_WORK.to_string()),
        }
    }

    pub fn is_no_work(&self) -> bool {
        self.error.as_deref() == Some(NO_WORK)
    }
}

/// `send-results` body: the full list of the worker's completed output paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsRequest {
    pub drive_key: String,
    pub segments: Vec<String>,
}

/// `send-results` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultsReply {
    pub fn ok() -> Self {
        ResultsReply {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        ResultsReply {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// `store-get` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreGetRequest {
    pub path: String,
}

/// `store-list` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreListRequest {
    pub dir: String,
}

/// `store-list` reply: entry names within the directory, sorted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreListReply {
    pub entries: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_request_uses_camel_case_field() {
        let req = WorkRequest {
            drive_key: "ab".into(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["driveKey"], "ab");
    }

    #[test]
    fn no_work_reply_shape() {
        let v = serde_json::to_value(WorkReply::no_work()).unwrap();
        assert_eq!(v, serde_json::json!({"error": "no-work"}));
    }

    #[test]
    fn no_work_detection() {
        assert!(WorkReply::no_work().is_no_work());
        assert!(!WorkReply::assignment("/segments/inputs/a.264", None).is_no_work());
    }

    #[test]
    fn reply_tolerates_unknown_fields() {
        let json = r#"{"segment":"/segments/inputs/a.264","futureField":42}"#;
        let reply: WorkReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.segment.as_deref(), Some("/segments/inputs/a.264"));
        assert!(!reply.is_no_work());
    }

    #[test]
    fn results_reply_shapes() {
        let ok = serde_json::to_value(ResultsReply::ok()).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true}));
        let failed = serde_json::to_value(ResultsReply::failed("pull failed")).unwrap();
        assert_eq!(
            failed,
            serde_json::json!({"success": false, "error": "pull failed"})
        );
    }
}
