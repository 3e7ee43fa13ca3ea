use crate::error::Error;
use crate::source::ApiOrigin;
use log::debug;
use reqwest::{Client, Url};

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait HttpSource: Send + Sync {
    /// Fetches the raw body of a partner API endpoint.
    /// # Arguments
    /// * `url` - The fully rendered request URL.
    /// # Returns
    /// A Result containing either the response body or an Error. Non-success
    /// statuses are errors.
    async fn get(&self, url: &str) -> Result<String, Error>;
}

#[derive(Clone, Default)]
pub struct ApiClient {
    client: Client,
}

impl ApiClient {
    pub fn new() -> Self {
        ApiClient {
            client: Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl HttpSource for ApiClient {
    async fn get(&self, url: &str) -> Result<String, Error> {
        let url = Url::parse(url)?;
        debug!("GET {}{}", url.host_str().unwrap_or_default(), url.path());

        let resp = self.client.get(url).send().await?.error_for_status()?;

        Ok(resp.text().await?)
    }
}

/// The literal `api_key` wins; otherwise the key is read from `api_key_env`.
/// Sources without either get an empty key.
pub fn resolve_api_key(origin: &ApiOrigin) -> Result<String, Error> {
    if let Some(key) = &origin.api_key {
        return Ok(key.clone());
    }
    match &origin.api_key_env {
        Some(var) => std::env::var(var)
            .map_err(|_| Error::config(format!("environment variable '{}' is not set", var))),
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn origin(api_key: Option<&str>, api_key_env: Option<&str>) -> ApiOrigin {
        ApiOrigin {
            url: "https://example.com".to_string(),
            api_key: api_key.map(str::to_string),
            api_key_env: api_key_env.map(str::to_string),
            request_interval: 1.0,
            iterator: None,
            page_size: None,
            json_path_page_count: None,
        }
    }

    #[tokio::test]
    async fn test_get_returns_body() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/api/report")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(200)
            .with_body(r#"{"data": []}"#)
            .create_async()
            .await;

        let client = ApiClient::new();
        let body = client
            .get(&format!("{}/api/report?page=2", server.url()))
            .await
            .unwrap();
        assert_eq!(body, r#"{"data": []}"#);
    }

    #[tokio::test]
    async fn test_get_error_status() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/api/report")
            .with_status(500)
            .create_async()
            .await;

        let client = ApiClient::new();
        let result = client.get(&format!("{}/api/report", server.url())).await;
        assert!(matches!(result.unwrap_err(), Error::ApiFailure(_)));
    }

    #[tokio::test]
    async fn test_get_invalid_url() {
        let client = ApiClient::new();
        let result = client.get("invalid_url").await;
        assert!(matches!(result.unwrap_err(), Error::UrlParsingFailed(_)));
    }

    #[test]
    fn test_resolve_api_key() {
        assert_eq!(resolve_api_key(&origin(Some("abc"), None)).unwrap(), "abc");
        assert_eq!(resolve_api_key(&origin(None, None)).unwrap(), "");
        assert!(matches!(
            resolve_api_key(&origin(None, Some("BI_PIPELINE_TEST_UNSET_KEY"))).unwrap_err(),
            Error::Config { .. }
        ));
    }
}
