use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRef, FromRequest, Request};
use axum::http::StatusCode;

use crate::config::Config;

pub mod hmac;

/// The raw webhook body, signature-verified against `Config::webhook_secret`.
/// Pass-through when no secret is configured (§6: "unsigned mode is
/// permitted only when no secret is configured"); otherwise requires a
/// matching `X-Webhook-Signature: sha256=<hex>` header.
pub struct VerifiedBody(pub Bytes);

impl<S> FromRequest<S> for VerifiedBody
where
    S: Send + Sync,
    Arc<Config>: FromRef<S>,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let config = Arc::<Config>::from_ref(state);
        let signature = req
            .headers()
            .get("X-Webhook-Signature")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = Bytes::from_request(req, state)
            .await
            .map_err(|_| (StatusCode::BAD_REQUEST, "failed to read request body"))?;

        if let Some(secret) = &config.webhook_secret {
            let Some(signature) = signature else {
                return Err((StatusCode::UNAUTHORIZED, "missing X-Webhook-Signature header"));
            };
            if !hmac::validate_hmac(secret, &body, &signature) {
                return Err((StatusCode::UNAUTHORIZED, "invalid webhook signature"));
            }
        }

        Ok(VerifiedBody(body))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    #[derive(Clone)]
    struct TestState(Arc<Config>);

    impl FromRef<TestState> for Arc<Config> {
        fn from_ref(state: &TestState) -> Self {
            state.0.clone()
        }
    }

    fn config(secret: Option<&str>) -> Arc<Config> {
        Arc::new(Config {
            database_url: String::new(),
            webhook_secret: secret.map(str::to_string),
            webhook_rate_limit_per_minute: 200,
            telegram_bot_token: None,
            telegram_chat_id: None,
            rest_days: 14,
            quarantine_days: 30,
            emergency_bounce_pct: 5.0,
            emergency_spam_pct: 0.1,
            max_bounce_7d_pct: 2.0,
            max_spam_7d_pct: 0.03,
            bounce_pause_hours: 72,
            spam_pause_hours: 96,
            retry_max_retries: 10,
            retry_queue_path: "/tmp/sendguard-test-retry-queue.jsonl".into(),
            node_connect_timeout: std::time::Duration::from_secs(10),
            node_call_timeout: std::time::Duration::from_secs(30),
            dns_resolver_timeout: std::time::Duration::from_secs(5),
            downstream_http_timeout: std::time::Duration::from_secs(10),
            graceful_reload_queue_depth_threshold: 1000,
        })
    }

    #[tokio::test]
    async fn passes_through_when_no_secret_configured() {
        let state = TestState(config(None));
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/webhooks/bounce")
            .body(Body::from("{}"))
            .unwrap();

        let body = VerifiedBody::from_request(req, &state).await.unwrap();
        assert_eq!(&body.0[..], b"{}");
    }

    #[tokio::test]
    async fn rejects_missing_signature_when_secret_configured() {
        let state = TestState(config(Some("topsecret")));
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/webhooks/bounce")
            .body(Body::from("{}"))
            .unwrap();

        let result = VerifiedBody::from_request(req, &state).await;
        assert_eq!(result.err().map(|(status, _)| status), Some(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn accepts_valid_signature() {
        let secret = "topsecret";
        let payload = b"{\"email\":\"a@b.com\"}";
        let sig = hmac::sign(secret, payload);
        let state = TestState(config(Some(secret)));

        let req = HttpRequest::builder()
            .method("POST")
            .uri("/webhooks/bounce")
            .header("X-Webhook-Signature", format!("sha256={sig}"))
            .body(Body::from(&payload[..]))
            .unwrap();

        let body = VerifiedBody::from_request(req, &state).await.unwrap();
        assert_eq!(&body.0[..], payload);
    }
}
