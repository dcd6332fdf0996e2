//! Connection admission
//!
//! Runs inside the WebSocket handshake callback, before the socket is
//! promoted. A connection is admitted when its identity checks out and the
//! display name is not already registered.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};

use crate::error::AdmissionError;
use crate::hub::HubHandle;
use crate::types::Username;

/// Who a connection claims to be, once verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: Username,
    /// Subprotocol to echo back in the handshake response
    pub subprotocol: Option<String>,
}

/// Derives an identity from the upgrade request
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &Request) -> Result<Identity, AdmissionError>;
}

/// Takes the display name from `?username=`
#[derive(Debug, Default, Clone, Copy)]
pub struct UsernameAuthenticator;

impl Authenticator for UsernameAuthenticator {
    fn authenticate(&self, request: &Request) -> Result<Identity, AdmissionError> {
        let raw = query_param(request.uri().query(), "username").unwrap_or_default();
        Ok(Identity {
            name: Username::parse(&raw)?,
            subprotocol: None,
        })
    }
}

/// Bearer token claims; `sub` is the display name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
}

/// Verifies an HS256 token passed in `Sec-WebSocket-Protocol`
///
/// Browsers cannot set an Authorization header on a WebSocket upgrade, so the
/// token rides in the subprotocol field and is echoed back on success.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, request: &Request) -> Result<Identity, AdmissionError> {
        let token = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AdmissionError::MissingCredential)?;

        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AdmissionError::InvalidCredential(e.to_string()))?;

        Ok(Identity {
            name: Username::parse(&data.claims.sub)?,
            subprotocol: Some(token.to_string()),
        })
    }
}

/// Authenticate and check the name against the current roster
///
/// The hub repeats the name check on registration, so a race between two
/// handshakes for the same name still admits at most one.
pub fn admit(
    request: &Request,
    authenticator: &dyn Authenticator,
    hub: &HubHandle,
) -> Result<Identity, AdmissionError> {
    let identity = authenticator.authenticate(request)?;
    if hub.is_name_taken(identity.name.as_str()) {
        return Err(AdmissionError::NameTaken(identity.name.to_string()));
    }
    Ok(identity)
}

/// Handshake response for an admitted connection
pub fn accept_response(
    mut response: Response,
    identity: &Identity,
) -> Result<Response, AdmissionError> {
    if let Some(protocol) = &identity.subprotocol {
        let value = HeaderValue::from_str(protocol)
            .map_err(|e| AdmissionError::InvalidCredential(e.to_string()))?;
        response
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
    }
    Ok(response)
}

impl AdmissionError {
    /// HTTP status sent instead of the upgrade
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::InvalidUsername(_) => StatusCode::BAD_REQUEST,
            AdmissionError::MissingCredential | AdmissionError::InvalidCredential(_) => {
                StatusCode::UNAUTHORIZED
            }
            AdmissionError::NameTaken(_) => StatusCode::CONFLICT,
        }
    }

    /// Handshake rejection carrying the reason as body
    pub fn to_response(&self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = self.status();
        response
    }
}

/// First value for `key`, percent- and `+`-decoded
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"test-secret";

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    fn request_with_protocol(token: &str) -> Request {
        Request::builder()
            .uri("ws://localhost/")
            .header(header::SEC_WEBSOCKET_PROTOCOL, token)
            .body(())
            .unwrap()
    }

    fn token(sub: &str, exp_offset_secs: i64, secret: &[u8]) -> String {
        let exp = (Utc::now().timestamp() + exp_offset_secs) as u64;
        let claims = Claims {
            sub: sub.to_string(),
            exp,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("a=1&username=alice"), "username"),
            Some("alice".to_string())
        );
        assert_eq!(query_param(Some("a=1"), "username"), None);
        assert_eq!(query_param(None, "username"), None);
    }

    #[test]
    fn test_query_param_decodes_values() {
        assert_eq!(
            query_param(Some("username=jos%C3%A9"), "username"),
            Some("josé".to_string())
        );
        assert_eq!(
            query_param(Some("username=alice%5F1"), "username"),
            Some("alice_1".to_string())
        );
        assert_eq!(
            query_param(Some("username=bob+"), "username"),
            Some("bob ".to_string())
        );
    }

    #[test]
    fn test_username_authenticator_accepts_encoded_names() {
        let identity = UsernameAuthenticator
            .authenticate(&request("ws://localhost/ws?username=jos%C3%A9"))
            .unwrap();
        assert_eq!(identity.name.as_str(), "josé");

        let identity = UsernameAuthenticator
            .authenticate(&request("ws://localhost/ws?username=alice%5F1"))
            .unwrap();
        assert_eq!(identity.name.as_str(), "alice_1");

        // Trailing `+` decodes to a space, which parse trims
        let identity = UsernameAuthenticator
            .authenticate(&request("ws://localhost/ws?username=bob+"))
            .unwrap();
        assert_eq!(identity.name.as_str(), "bob");
    }

    #[test]
    fn test_username_authenticator() {
        let identity = UsernameAuthenticator
            .authenticate(&request("ws://localhost/ws?username=alice"))
            .unwrap();
        assert_eq!(identity.name.as_str(), "alice");
        assert!(identity.subprotocol.is_none());
    }

    #[test]
    fn test_username_authenticator_rejects_missing_or_invalid() {
        let missing = UsernameAuthenticator.authenticate(&request("ws://localhost/ws"));
        assert!(matches!(missing, Err(AdmissionError::InvalidUsername(_))));

        let invalid = UsernameAuthenticator.authenticate(&request("ws://localhost/?username=a!"));
        assert_eq!(
            invalid.unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_jwt_authenticator_accepts_valid_token() {
        let auth = JwtAuthenticator::new(SECRET);
        let token = token("alice", 3600, SECRET);
        let identity = auth.authenticate(&request_with_protocol(&token)).unwrap();
        assert_eq!(identity.name.as_str(), "alice");
        assert_eq!(identity.subprotocol.as_deref(), Some(token.as_str()));
    }

    #[test]
    fn test_jwt_authenticator_rejects_bad_tokens() {
        let auth = JwtAuthenticator::new(SECRET);

        let missing = auth.authenticate(&request("ws://localhost/"));
        assert_eq!(missing, Err(AdmissionError::MissingCredential));

        let expired = auth.authenticate(&request_with_protocol(&token("alice", -3600, SECRET)));
        assert!(matches!(expired, Err(AdmissionError::InvalidCredential(_))));

        let forged = auth.authenticate(&request_with_protocol(&token("alice", 3600, b"other")));
        assert_eq!(forged.unwrap_err().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_accept_response_echoes_subprotocol() {
        let identity = Identity {
            name: Username::parse("alice").unwrap(),
            subprotocol: Some("abc.def.ghi".to_string()),
        };
        let response = accept_response(Response::new(()), &identity).unwrap();
        assert_eq!(
            response.headers().get(header::SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "abc.def.ghi"
        );
    }

    #[test]
    fn test_rejection_response() {
        let response = AdmissionError::NameTaken("alice".to_string()).to_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.body().as_deref(),
            Some("Username 'alice' is already taken")
        );
    }
}
