use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload POSTed to the entitled-check endpoint: the raw entitlements
/// grants plus whether the backend should mint a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitledCheckRequest {
    pub create_session: bool,
    pub swg: Value,
}

/// Reply shape shared by both resolution endpoints. Parsed defensively:
/// anything missing defaults rather than failing the resolution.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    #[serde(default)]
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub newly_created: bool,
}

/// Outcome of reconciling an external-client result with the backend
/// session service.
#[derive(Debug, Clone, PartialEq)]
pub struct UserResolution {
    /// The user still has to pass through the consent form.
    pub consent_required: bool,
    /// No session could be minted; the user must log in themselves.
    pub login_required: bool,
    /// Backend reply, verbatim, for handler overrides that need more.
    pub raw: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entitled_check_request_uses_the_wire_names() {
        let request = EntitledCheckRequest {
            create_session: false,
            swg: json!({ "products": ["premium"] }),
        };
        let value = serde_json::to_value(&request).expect("serializes");
        assert_eq!(
            value,
            json!({ "createSession": false, "swg": { "products": ["premium"] } })
        );
    }

    #[test]
    fn session_response_tolerates_missing_fields() {
        let parsed: SessionResponse = serde_json::from_value(json!({})).expect("parses");
        assert!(parsed.user_info.is_none());

        let parsed: SessionResponse =
            serde_json::from_value(json!({ "userInfo": { "newlyCreated": true } }))
                .expect("parses");
        assert!(parsed.user_info.is_some_and(|info| info.newly_created));
    }
}
