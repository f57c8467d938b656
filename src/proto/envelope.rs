use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{CoreError, Result};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MIN_SUPPORTED_VERSION: u32 = 1;
pub const MAX_SUPPORTED_VERSION: u32 = 1;

/// Deserializers that accept either an integer or a string-encoded integer.
/// Egress always uses the plain integer form.
pub mod wire_int {
    use serde::{Deserialize, Deserializer};

    macro_rules! flexible {
        ($name:ident, $ty:ty) => {
            pub fn $name<'de, D>(d: D) -> Result<$ty, D::Error>
            where
                D: Deserializer<'de>,
            {
                #[derive(Deserialize)]
                #[serde(untagged)]
                enum Raw {
                    Int($ty),
                    Str(String),
                }
                match Raw::deserialize(d)? {
                    Raw::Int(v) => Ok(v),
                    Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
                }
            }
        };
    }

    flexible!(de_u64, u64);
    flexible!(de_u32, u32);
    flexible!(de_i64, i64);
    flexible!(de_i32, i32);
    flexible!(de_u16, u16);
}

/// Envelope fields present at the top level of every state-changing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(deserialize_with = "wire_int::de_u32")]
    pub version: u32,
    pub instance_id: String,
    pub auth_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_auth_key: Option<String>,
}

/// The local side's expectations against which inbound envelopes are checked.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub instance_id: String,
    pub auth_key: String,
    pub admin_auth_key: String,
}

impl AuthContext {
    pub fn envelope(&self) -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION,
            instance_id: self.instance_id.clone(),
            auth_key: self.auth_key.clone(),
            admin_auth_key: None,
        }
    }

    pub fn verify(&self, env: &Envelope) -> Result<()> {
        if env.version < MIN_SUPPORTED_VERSION || env.version > MAX_SUPPORTED_VERSION {
            return Err(CoreError::InvalidProtocol(format!(
                "unsupported protocol version {} (supported {}..={})",
                env.version, MIN_SUPPORTED_VERSION, MAX_SUPPORTED_VERSION
            )));
        }
        if env.instance_id != self.instance_id {
            return Err(CoreError::InvalidProtocol(format!(
                "instance id mismatch: got '{}'",
                env.instance_id
            )));
        }
        if env.auth_key != self.auth_key {
            return Err(CoreError::Auth("bad authentication key".to_string()));
        }
        Ok(())
    }

    /// Like [`verify`](Self::verify) but additionally requires the admin key.
    pub fn verify_admin(&self, env: &Envelope) -> Result<()> {
        self.verify(env)?;
        match &env.admin_auth_key {
            Some(k) if *k == self.admin_auth_key => Ok(()),
            _ => Err(CoreError::Auth("bad admin authentication key".to_string())),
        }
    }
}

/// Uniform JSON response envelope. HTTP 200 always carries one of these;
/// the embedded `success` field is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMsg {
    pub success: u8,
    #[serde(default)]
    pub error: String,
    #[serde(default = "empty_object")]
    pub error_ext: Value,
    #[serde(default)]
    pub warning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

fn empty_object() -> Value {
    json!({})
}

impl ResponseMsg {
    pub fn ok() -> Self {
        Self {
            success: 1,
            error: String::new(),
            error_ext: empty_object(),
            warning: String::new(),
            note: None,
        }
    }

    pub fn ok_note(note: &str) -> Self {
        Self {
            note: Some(note.to_string()),
            ..Self::ok()
        }
    }

    pub fn err(e: &CoreError) -> Self {
        Self {
            success: 0,
            error: e.to_string(),
            error_ext: json!({
                "code": e.wire_code(),
                "retryable": matches!(e.recovery(), crate::error::Recovery::Retryable),
            }),
            warning: String::new(),
            note: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success == 1
    }

    /// Convert a failed response back into the error it carries.
    pub fn to_error(&self) -> CoreError {
        let code = self
            .error_ext
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or(11) as i32;
        let retryable = self
            .error_ext
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        match CoreError::from_wire(code, self.error.clone()) {
            CoreError::WorkerRejectedBundle { reason, .. } => {
                CoreError::WorkerRejectedBundle { retryable, reason }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> AuthContext {
        AuthContext {
            instance_id: "inst".into(),
            auth_key: "key".into(),
            admin_auth_key: "admin".into(),
        }
    }

    #[test]
    fn envelope_accepts_string_version() {
        let env: Envelope = serde_json::from_value(json!({
            "version": "1",
            "instance_id": "inst",
            "auth_key": "key",
        }))
        .unwrap();
        assert_eq!(env.version, 1);
        // Egress is always the integer form.
        let out = serde_json::to_value(&env).unwrap();
        assert_eq!(out["version"], json!(1));
    }

    #[test]
    fn verify_rejects_version_out_of_range() {
        let mut env = ctx().envelope();
        env.version = MAX_SUPPORTED_VERSION + 1;
        assert!(matches!(
            ctx().verify(&env),
            Err(CoreError::InvalidProtocol(_))
        ));
    }

    #[test]
    fn verify_rejects_bad_auth() {
        let mut env = ctx().envelope();
        env.auth_key = "wrong".into();
        assert!(matches!(ctx().verify(&env), Err(CoreError::Auth(_))));
    }

    #[test]
    fn admin_key_required_for_admin_verify() {
        let mut env = ctx().envelope();
        assert!(ctx().verify_admin(&env).is_err());
        env.admin_auth_key = Some("admin".into());
        assert!(ctx().verify_admin(&env).is_ok());
    }

    #[test]
    fn response_error_round_trips_classification() {
        let e = CoreError::WorkerRejectedBundle {
            retryable: true,
            reason: "queue full".into(),
        };
        let resp = ResponseMsg::err(&e);
        let text = serde_json::to_string(&resp).unwrap();
        let parsed: ResponseMsg = serde_json::from_str(&text).unwrap();
        assert!(!parsed.is_success());
        assert_eq!(parsed.to_error(), e);
    }
}
