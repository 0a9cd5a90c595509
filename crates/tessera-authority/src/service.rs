//! Request handling, independent of the transport.

use tessera_common::{decode_frame, is_valid_peer_id, AuthorityRequest, AuthorityResponse};
use tessera_crypto::TrustAuthority;
use tracing::{debug, warn};

/// Answer one request.
pub fn handle_request(authority: &TrustAuthority, request: AuthorityRequest) -> AuthorityResponse {
    match request {
        AuthorityRequest::GetRootKey => AuthorityResponse::RootKey {
            key: authority.root_public_key_pem().to_string(),
        },
        AuthorityRequest::SignRequest {
            user_id,
            user_public_key,
        } => {
            if !is_valid_peer_id(&user_id) {
                return AuthorityResponse::Error {
                    message: format!("Invalid user id: {user_id:?}"),
                };
            }
            match authority.issue(&user_id, &user_public_key) {
                Ok(certificate) => AuthorityResponse::CertificateIssued {
                    payload: certificate,
                },
                Err(err) => {
                    warn!("refused to certify {}: {}", user_id, err);
                    AuthorityResponse::Error {
                        message: err.to_string(),
                    }
                }
            }
        }
    }
}

/// Parse and answer one text frame.
pub fn handle_text(authority: &TrustAuthority, text: &str) -> AuthorityResponse {
    match decode_frame::<AuthorityRequest>(text) {
        Ok(request) => handle_request(authority, request),
        Err(err) => {
            debug!("rejected authority request: {}", err);
            AuthorityResponse::Error {
                message: err.to_string(),
            }
        }
    }
}
