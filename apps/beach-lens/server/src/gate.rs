use axum::http::{header::AUTHORIZATION, HeaderMap};
use beach_lens_core::{LinkStore, LinkTarget, PathSigner};
use metrics::counter;
use tracing::debug;

use crate::error::LensError;

/// How a request got in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Redeemed one use of a link; the stream is fixed by its target.
    Link { id: String, target: LinkTarget },
    /// Carried a valid session bearer token.
    Session,
    /// Carried a valid signature for this exact path.
    Signed,
}

/// Authorization inputs pulled from a stream request.
#[derive(Debug, Default, Clone, Copy)]
pub struct GateRequest<'a> {
    pub embed: Option<&'a str>,
    /// With `embed`, the link id to redeem.
    pub link_id: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub path: &'a str,
}

#[derive(Clone)]
pub struct RequestGate {
    links: LinkStore,
    signer: PathSigner,
    access_tokens: Vec<String>,
}

impl RequestGate {
    pub fn new(links: LinkStore, signer: PathSigner, access_tokens: Vec<String>) -> Self {
        Self {
            links,
            signer,
            access_tokens,
        }
    }

    pub fn links(&self) -> &LinkStore {
        &self.links
    }

    pub fn signer(&self) -> &PathSigner {
        &self.signer
    }

    pub fn admit(&self, request: GateRequest<'_>, headers: &HeaderMap) -> Result<Admission, LensError> {
        if request.embed.is_some_and(is_truthy) {
            let id = request
                .link_id
                .filter(|id| !id.is_empty())
                .ok_or(LensError::MissingSource)?;
            return match self.links.resolve(id) {
                Ok(target) => {
                    counter!("beach_lens_link_resolutions_total", 1, "outcome" => "ok");
                    debug!(link_id = %id, "link redeemed");
                    Ok(Admission::Link {
                        id: id.to_string(),
                        target,
                    })
                }
                Err(err) => {
                    counter!(
                        "beach_lens_link_resolutions_total",
                        1,
                        "outcome" => err.metric_label()
                    );
                    debug!(link_id = %id, error = %err, "link rejected");
                    Err(err.into())
                }
            };
        }

        if self.session_valid(headers) {
            return Ok(Admission::Session);
        }

        match self.signer.verify(request.signature, request.path) {
            Ok(()) => Ok(Admission::Signed),
            Err(err) => {
                debug!(path = request.path, error = %err, "request rejected");
                Err(err.into())
            }
        }
    }

    /// Session authentication only; used by the service endpoints.
    pub fn require_session(&self, headers: &HeaderMap) -> Result<(), LensError> {
        if self.session_valid(headers) {
            Ok(())
        } else {
            Err(LensError::Unauthorized)
        }
    }

    fn session_valid(&self, headers: &HeaderMap) -> bool {
        let Some(token) = bearer_token(headers) else {
            return false;
        };
        self.access_tokens
            .iter()
            .any(|accepted| constant_time_eq(accepted.as_bytes(), token.as_bytes()))
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && !value.eq_ignore_ascii_case("0") && !value.eq_ignore_ascii_case("false")
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use time::Duration;

    const PATH: &str = "/api/webrtc/ws";

    fn gate() -> RequestGate {
        RequestGate::new(
            LinkStore::new(),
            PathSigner::new(b"gate-test-secret"),
            vec!["session-token".into()],
        )
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    fn embed(id: &str) -> GateRequest<'_> {
        GateRequest {
            embed: Some("1"),
            link_id: Some(id),
            signature: None,
            path: PATH,
        }
    }

    #[test_timeout::timeout]
    fn embed_with_valid_link_is_admitted_without_auth() {
        let gate = gate();
        let camera = LinkTarget::Entity("camera.front".into());
        gate.links().create("abc123", camera.clone(), 1, 60);

        let admission = gate.admit(embed("abc123"), &HeaderMap::new()).unwrap();
        assert_eq!(
            admission,
            Admission::Link {
                id: "abc123".into(),
                target: camera
            }
        );
        assert!(matches!(
            gate.admit(embed("abc123"), &HeaderMap::new()),
            Err(LensError::NotFound(_))
        ));
    }

    #[test_timeout::timeout]
    fn embed_never_falls_back_to_session() {
        let gate = gate();
        assert!(matches!(
            gate.admit(embed("nope"), &bearer("session-token")),
            Err(LensError::NotFound(_))
        ));
    }

    #[test_timeout::timeout]
    fn falsy_embed_values_require_auth() {
        let gate = gate();
        gate.links().create("abc", LinkTarget::Url("rtsp://x".into()), 0, 0);
        for marker in ["0", "false", ""] {
            let request = GateRequest {
                embed: Some(marker),
                ..embed("abc")
            };
            assert!(matches!(
                gate.admit(request, &HeaderMap::new()),
                Err(LensError::Unauthorized)
            ));
        }
    }

    #[test_timeout::timeout]
    fn session_token_is_admitted() {
        let request = GateRequest {
            path: PATH,
            ..Default::default()
        };
        assert_eq!(
            gate().admit(request, &bearer("session-token")).unwrap(),
            Admission::Session
        );
        assert!(matches!(
            gate().admit(request, &bearer("session-token-x")),
            Err(LensError::Unauthorized)
        ));
    }

    #[test_timeout::timeout]
    fn signed_request_is_admitted_and_tampering_is_not() {
        let gate = gate();
        let token = gate.signer().sign(PATH, Duration::minutes(1)).unwrap();
        let request = GateRequest {
            signature: Some(&token),
            path: PATH,
            ..Default::default()
        };
        assert_eq!(gate.admit(request, &HeaderMap::new()).unwrap(), Admission::Signed);

        let mut tampered = token.clone();
        tampered.push('x');
        let request = GateRequest {
            signature: Some(&tampered),
            path: PATH,
            ..Default::default()
        };
        assert!(matches!(
            gate.admit(request, &HeaderMap::new()),
            Err(LensError::Unauthorized)
        ));

        let other_path = GateRequest {
            signature: Some(&token),
            path: "/api/webrtc/stream",
            ..Default::default()
        };
        assert!(matches!(
            gate.admit(other_path, &HeaderMap::new()),
            Err(LensError::Unauthorized)
        ));
    }

    #[test_timeout::timeout]
    fn require_session_ignores_signatures() {
        assert!(gate().require_session(&bearer("session-token")).is_ok());
        assert!(matches!(
            gate().require_session(&HeaderMap::new()),
            Err(LensError::Unauthorized)
        ));
    }
}
