use crate::error::CmgError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use vipcore::types::{CallType, LogicalAddress};

/// Delivery channel of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushType {
    /// VoIP push: the payload is base64-encoded JSON.
    Voip,
    /// Regular notification: the payload is the JSON object itself.
    Standard,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PushAction {
    /// A unit is calling; connect so the call can be delivered.
    #[default]
    Call,
    /// The caller gave up before we connected.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    #[serde(default)]
    pub action: PushAction,
    /// Rendezvous name for P2P negotiation, when the push names one.
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub caller: LogicalAddress,
    #[serde(default)]
    pub call_type: Option<CallType>,
}

/// Decodes a push payload. Decoding is all that happens on the caller's
/// thread.
pub fn decode_push(payload: &[u8], kind: PushType) -> Result<PushPayload, CmgError> {
    let json = match kind {
        PushType::Voip => {
            let text: Vec<u8> = payload
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            STANDARD
                .decode(text)
                .map_err(|e| CmgError::Generic(format!("invalid push encoding: {e}")))?
        }
        PushType::Standard => payload.to_vec(),
    };
    serde_json::from_slice(&json).map_err(|e| CmgError::Generic(format!("invalid push payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voip_push_is_base64_json() {
        let json = br#"{"action":"call","session":"s-17","caller":"00010002","callType":"audioVideo"}"#;
        let encoded = STANDARD.encode(json);
        let push = decode_push(encoded.as_bytes(), PushType::Voip).unwrap();
        assert_eq!(push.action, PushAction::Call);
        assert_eq!(push.session.as_deref(), Some("s-17"));
        assert_eq!(push.caller, LogicalAddress::new("00010002"));
        assert_eq!(push.call_type, Some(CallType::AudioVideo));
    }

    #[test]
    fn test_standard_push_defaults() {
        let push = decode_push(br#"{"action":"cancel"}"#, PushType::Standard).unwrap();
        assert_eq!(push.action, PushAction::Cancel);
        assert_eq!(push.session, None);
        assert!(push.caller.is_empty());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            decode_push(b"%%%", PushType::Voip),
            Err(CmgError::Generic(_))
        ));
        assert!(decode_push(b"{", PushType::Standard).is_err());
    }
}
