use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use std::time::Duration;

use super::{LikeTransport, TransportError, UpstreamBody};

/// `GET {url}?uid=..&region=..` against the like service.
pub struct HttpTransport {
    client: Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn request_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(e.to_string())
    }
}

#[async_trait]
impl LikeTransport for HttpTransport {
    async fn fetch(&self, target_id: &str, region: &str) -> Result<UpstreamBody, TransportError> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[("uid", target_id), ("region", region)])
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        // A 5xx is the service falling over, whatever the body says.
        if status.is_server_error() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let text = resp.text().await.map_err(request_error)?;
        match serde_json::from_str::<Value>(&text) {
            Ok(v) if v.is_object() => serde_json::from_value::<UpstreamBody>(v)
                .map_err(|e| TransportError::Malformed(e.to_string())),
            _ if !status.is_success() => Err(TransportError::Status(status.as_u16())),
            Ok(_) => Err(TransportError::Malformed("body is not a json object".into())),
            Err(e) => Err(TransportError::Malformed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer, timeout: Duration) -> HttpTransport {
        HttpTransport::new(format!("{}/like", server.uri()), timeout).unwrap()
    }

    #[tokio::test]
    async fn sends_uid_and_region_as_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/like"))
            .and(query_param("uid", "123456789"))
            .and(query_param("region", "IND"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 1,
                "player": { "nickname": "Neo", "uid": "123456789", "region": "IND" },
                "likes": { "before": 1, "after": 101, "added_by_api": 100 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let body = transport(&server, Duration::from_secs(5))
            .fetch("123456789", "IND")
            .await
            .unwrap();

        assert_eq!(body.status, Some(json!(1)));
        assert_eq!(body.likes.unwrap().added_by_api, Some(json!(100)));
    }

    #[tokio::test]
    async fn server_error_is_a_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_json(json!({ "status": 1 })))
            .mount(&server)
            .await;

        let err = transport(&server, Duration::from_secs(5))
            .fetch("1", "IND")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Status(502));
    }

    #[tokio::test]
    async fn client_error_with_json_body_is_passed_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "status": 0, "error": "bad uid" })),
            )
            .mount(&server)
            .await;

        let body = transport(&server, Duration::from_secs(5))
            .fetch("1", "IND")
            .await
            .unwrap();
        assert_eq!(body.error, Some(json!("bad uid")));
    }

    #[tokio::test]
    async fn non_json_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = transport(&server, Duration::from_secs(5))
            .fetch("1", "IND")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "status": 1 }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let err = transport(&server, Duration::from_millis(50))
            .fetch("1", "IND")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout);
    }
}
