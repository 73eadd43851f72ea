use super::{
    BulkByQueryResponse, DeleteByQuery, ScrollPage, SearchHit, SearchIndex, SearchRequest,
    UpdateByQuery,
};
use crate::config::IndexConfig;
use crate::core::{ReconcileError, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{Level, event};

/// Elasticsearch REST client.
///
/// One instance is created per run and shared by reference; requests are
/// independent so no locking is needed.
#[derive(Debug, Clone)]
pub struct ElasticIndex {
    client: Client,
    base_url: String,
    credentials: Option<(String, Option<String>)>,
}

#[derive(Deserialize)]
struct SearchBody {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: HitsBody,
}

#[derive(Deserialize)]
struct HitsBody {
    #[serde(default)]
    hits: Vec<HitBody>,
}

#[derive(Deserialize)]
struct HitBody {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: Option<Value>,
}

impl From<SearchBody> for ScrollPage {
    fn from(body: SearchBody) -> Self {
        Self {
            scroll_id: body.scroll_id,
            hits: body
                .hits
                .hits
                .into_iter()
                .map(|hit| SearchHit {
                    id: hit.id,
                    source: hit.source,
                })
                .collect(),
        }
    }
}

fn keep_alive_param(keep_alive: Duration) -> String {
    format!("{}ms", keep_alive.as_millis())
}

impl ElasticIndex {
    pub fn connect(config: &IndexConfig) -> Result<Self> {
        event!(Level::DEBUG, url = %config.url, "creating search index client");
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let credentials = config
            .username
            .as_ref()
            .map(|user| (user.clone(), config.password.clone()));
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path));
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, password.as_ref()),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|err| format!("<unreadable body: {}>", err));
            return Err(ReconcileError::IndexApi {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl SearchIndex for ElasticIndex {
    async fn open_scroll(
        &self,
        request: &SearchRequest,
        keep_alive: Duration,
    ) -> Result<ScrollPage> {
        let query = request
            .query
            .as_ref()
            .map(|query| query.to_json())
            .unwrap_or_else(|| json!({ "match_all": {} }));
        let body = json!({
            "query": query,
            "_source": request.fetch_source,
            "size": request.size,
            "sort": [{ request.sort_field.as_str(): { "order": "asc" } }],
        });
        let builder = self
            .request(Method::POST, &format!("{}/_search", request.index))
            .query(&[("scroll", keep_alive_param(keep_alive))])
            .json(&body);
        let page: SearchBody = self.send(builder).await?;
        Ok(page.into())
    }

    async fn next_page(&self, scroll_id: &str, keep_alive: Duration) -> Result<ScrollPage> {
        let builder = self.request(Method::POST, "_search/scroll").json(&json!({
            "scroll": keep_alive_param(keep_alive),
            "scroll_id": scroll_id,
        }));
        let page: SearchBody = self.send(builder).await?;
        Ok(page.into())
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
        let builder = self
            .request(Method::DELETE, "_search/scroll")
            .json(&json!({ "scroll_id": [scroll_id] }));
        let _: Value = self.send(builder).await?;
        Ok(())
    }

    async fn update_by_query(&self, request: &UpdateByQuery) -> Result<BulkByQueryResponse> {
        let (source, params) = request.script.to_painless();
        let builder = self
            .request(Method::POST, &format!("{}/_update_by_query", request.index))
            .query(&[("conflicts", request.conflicts.as_str())])
            .json(&json!({
                "query": request.query.to_json(),
                "script": { "source": source, "lang": "painless", "params": params },
            }));
        self.send(builder).await
    }

    async fn delete_by_query(&self, request: &DeleteByQuery) -> Result<BulkByQueryResponse> {
        let builder = self
            .request(Method::POST, &format!("{}/_delete_by_query", request.index))
            .query(&[("conflicts", request.conflicts.as_str())])
            .json(&json!({ "query": request.query.to_json() }));
        self.send(builder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_body_maps_hits_to_page() {
        let body: SearchBody = serde_json::from_value(json!({
            "_scroll_id": "abc",
            "hits": {"total": {"value": 2}, "hits": [
                {"_id": "10", "_index": "x"},
                {"_id": "11", "_source": {"key": 11}}
            ]}
        }))
        .unwrap();
        let page = ScrollPage::from(body);
        assert_eq!(page.scroll_id.as_deref(), Some("abc"));
        assert_eq!(page.hits.len(), 2);
        assert_eq!(page.hits[0].id, "10");
        assert_eq!(page.hits[1].source, Some(json!({"key": 11})));
    }

    #[test]
    fn keep_alive_is_rendered_in_millis() {
        assert_eq!(keep_alive_param(Duration::from_secs(60)), "60000ms");
    }
}
