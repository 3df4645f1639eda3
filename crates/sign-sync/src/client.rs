//! Bounded-concurrency client for the Sign REST API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use signsync_core::config::{ApiVersion, SignOrgConfig};
use signsync_core::error::{Result, SignSyncError};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::batch::{run_batched, BatchReport};
use crate::connector::{FetchFailure, FetchedUsers, SignConnector};
use crate::models::{
    BaseUris, CreatedId, DetailedUserInfo, GroupCreationInfo, GroupInfo, GroupsInfo, SignUser,
    UserCreationInfo, UserGroupsInfo, UserStateInfo, UsersInfo, INACTIVE_STATUS,
};
use crate::retry::RetryPolicy;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Transport};

type Headers = Vec<(String, String)>;

/// Client for one Sign organization.
pub struct SignClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    host: String,
    key: String,
    admin_email: String,
    api_version: ApiVersion,
    org: String,
    concurrency: usize,
    batch_size: usize,
    base_uri: OnceCell<String>,
    fetched_count: AtomicUsize,
    updated_count: AtomicUsize,
}

impl SignClient {
    /// Create a client that talks HTTP. Fails if a required key is missing.
    pub fn new(config: &SignOrgConfig) -> Result<Self> {
        config.require_keys()?;
        let transport = HttpTransport::new(Duration::from_secs(config.timeout_secs))?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client on top of an arbitrary transport.
    pub fn with_transport(config: &SignOrgConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.require_keys()?;
        Ok(Self {
            transport,
            retry: RetryPolicy::new(config.max_retries),
            host: host_url(config.host.as_deref().unwrap_or_default()),
            key: config.key.clone().unwrap_or_default(),
            admin_email: config.admin_email.clone().unwrap_or_default(),
            api_version: config.api_version,
            org: config
                .console_org
                .clone()
                .unwrap_or_else(|| "main".to_string()),
            concurrency: config.request_concurrency.max(1),
            batch_size: config.batch_size.max(1),
            base_uri: OnceCell::new(),
            fetched_count: AtomicUsize::new(0),
            updated_count: AtomicUsize::new(0),
        })
    }

    /// Override the retry policy (tests use a zero backoff delay).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Auth headers for the configured API version.
    pub fn header(&self) -> Headers {
        match self.api_version {
            ApiVersion::V6 => vec![
                ("Authorization".to_string(), format!("Bearer {}", self.key)),
                ("Connection".to_string(), "close".to_string()),
            ],
            ApiVersion::V5 => vec![("Access-Token".to_string(), self.key.clone())],
        }
    }

    /// Auth headers plus JSON content negotiation.
    pub fn header_json(&self) -> Headers {
        let mut headers = self.header();
        headers.push(("Content-Type".to_string(), "application/json".to_string()));
        headers.push(("Accept".to_string(), "application/json".to_string()));
        headers
    }

    fn discovery_url(&self) -> String {
        let endpoint = match self.api_version {
            ApiVersion::V5 => "base_uris",
            ApiVersion::V6 => "baseUris",
        };
        format!("{}/api/rest/{}/{endpoint}", self.host, self.api_version.as_str())
    }

    /// API base URI, discovered on first use and cached afterwards.
    pub async fn base_uri(&self) -> Result<&str> {
        self.base_uri
            .get_or_try_init(|| self.discover_base_uri())
            .await
            .map(String::as_str)
    }

    async fn discover_base_uri(&self) -> Result<String> {
        let request = ApiRequest::new(Method::GET, self.discovery_url(), self.header());
        let uris: BaseUris = parse(&self.call(request).await?, "base URI discovery")?;
        let access_point = if uris.api_access_point.ends_with('/') {
            uris.api_access_point
        } else {
            format!("{}/", uris.api_access_point)
        };
        let base = format!("{access_point}api/rest/{}/", self.api_version.as_str());
        info!(org = %self.org, base_uri = %base, "discovered Sign API base URI");
        Ok(base)
    }

    async fn call(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.retry
            .call(self.transport.as_ref(), &request, &self.org)
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String, what: &str) -> Result<T> {
        let resp = self
            .call(ApiRequest::new(Method::GET, url, self.header()))
            .await?;
        parse(&resp, what)
    }

    async fn put_json(&self, url: String, headers: &[(String, String)], body: serde_json::Value) -> Result<()> {
        self.call(ApiRequest::new(Method::PUT, url, headers.to_vec()).with_json(body))
            .await?;
        let total = self.updated_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(org = %self.org, total, "Total updated");
        Ok(())
    }

    async fn fetch_user(&self, base: &str, headers: &[(String, String)], user_id: &str) -> Result<Option<SignUser>> {
        let resp = self
            .call(ApiRequest::new(
                Method::GET,
                format!("{base}users/{user_id}"),
                headers.to_vec(),
            ))
            .await?;
        let total = self.fetched_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(org = %self.org, total, "Total retrieved");

        let mut info: DetailedUserInfo = parse(&resp, "get user")?;
        if !info.is_active() || info.email.eq_ignore_ascii_case(&self.admin_email) {
            return Ok(None);
        }
        if info.id.is_empty() {
            info.id = user_id.to_string();
        }

        let resp = self
            .call(ApiRequest::new(
                Method::GET,
                format!("{base}users/{user_id}/groups"),
                headers.to_vec(),
            ))
            .await?;
        let groups: UserGroupsInfo = parse(&resp, "get user groups")?;
        debug!(org = %self.org, email = %info.email, "retrieved Sign user details");

        Ok(Some(SignUser {
            info,
            groups: groups.group_info_list,
        }))
    }

    async fn list_user_refs(&self, base: &str) -> Result<Vec<crate::models::UserRef>> {
        let mut refs = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let url = page_url(&format!("{base}users"), cursor.as_deref())?;
            let page: UsersInfo = self.get_json(url, "list users").await?;
            refs.extend(page.user_info_list);
            cursor = next_cursor(page.page);
            if cursor.is_none() {
                break;
            }
        }
        Ok(refs)
    }
}

#[async_trait]
impl SignConnector for SignClient {
    fn org_label(&self) -> &str {
        &self.org
    }

    async fn get_groups(&self) -> Result<HashMap<String, GroupInfo>> {
        let base = self.base_uri().await?;
        let mut groups = HashMap::new();
        let mut cursor: Option<String> = None;
        loop {
            let url = page_url(&format!("{base}groups"), cursor.as_deref())?;
            let page: GroupsInfo = self.get_json(url, "list groups").await?;
            for group in page.group_info_list {
                groups.insert(group.group_name.to_lowercase(), group);
            }
            cursor = next_cursor(page.page);
            if cursor.is_none() {
                break;
            }
        }
        debug!(org = %self.org, count = groups.len(), "retrieved Sign groups");
        Ok(groups)
    }

    async fn create_group(&self, name: &str) -> Result<GroupInfo> {
        let base = self.base_uri().await?;
        let body = to_json(&GroupCreationInfo {
            group_name: name.to_string(),
        })?;
        let resp = self
            .call(ApiRequest::new(Method::POST, format!("{base}groups"), self.header_json()).with_json(body))
            .await?;
        let created: CreatedId = parse(&resp, "create group")?;
        info!(org = %self.org, group = name, id = %created.id, "created Sign group");
        Ok(GroupInfo {
            group_id: created.id,
            group_name: name.to_string(),
            created_date: None,
            is_default_group: false,
        })
    }

    async fn get_users(&self) -> Result<FetchedUsers> {
        let base = self.base_uri().await?;
        info!(org = %self.org, "getting list of all Sign users");
        let refs = self.list_user_refs(base).await?;

        let headers = self.header();
        let headers = &headers;
        let results = run_batched(&refs, self.batch_size, self.concurrency, &self.org, |user| async move {
            self.fetch_user(base, headers, &user.id).await
        })
        .await;

        let mut fetched = FetchedUsers::default();
        for (user_ref, result) in refs.iter().zip(results) {
            match result {
                Ok(Some(user)) => {
                    fetched.users.insert(user.info.email.to_lowercase(), user);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        org = %self.org,
                        user_id = %user_ref.id,
                        email = user_ref.email.as_deref().unwrap_or_default(),
                        error = %e,
                        "error fetching Sign user"
                    );
                    fetched.failures.push(FetchFailure {
                        user_id: user_ref.id.clone(),
                        email: user_ref.email.clone(),
                        error: e,
                    });
                }
            }
        }
        info!(
            org = %self.org,
            listed = refs.len(),
            active = fetched.users.len(),
            failed = fetched.failures.len(),
            "retrieved Sign users"
        );
        Ok(fetched)
    }

    async fn insert_user(&self, user: &UserCreationInfo) -> Result<String> {
        let base = self.base_uri().await?;
        let body = to_json(user)?;
        let resp = self
            .call(ApiRequest::new(Method::POST, format!("{base}users"), self.header_json()).with_json(body))
            .await?;
        let created: CreatedId = parse(&resp, "create user")?;
        info!(org = %self.org, email = %user.email, id = %created.id, "created Sign user");
        Ok(created.id)
    }

    async fn update_users(&self, users: &[DetailedUserInfo]) -> Result<BatchReport> {
        if users.is_empty() {
            return Ok(BatchReport::default());
        }
        let base = self.base_uri().await?;
        let headers = self.header_json();
        let headers = &headers;
        let results = run_batched(users, self.batch_size, self.concurrency, &self.org, |user| async move {
            self.put_json(format!("{base}users/{}", user.id), headers, to_json(user)?)
                .await?;
            info!(
                org = %self.org,
                email = %user.email,
                is_account_admin = user.is_account_admin,
                "updated Sign user"
            );
            Ok(())
        })
        .await;
        Ok(BatchReport::collect(
            users.iter().map(|u| u.email.clone()),
            results,
            "update user",
            &self.org,
        ))
    }

    async fn update_user_groups(&self, updates: &[(String, UserGroupsInfo)]) -> Result<BatchReport> {
        if updates.is_empty() {
            return Ok(BatchReport::default());
        }
        let base = self.base_uri().await?;
        let headers = self.header_json();
        let headers = &headers;
        let results = run_batched(updates, self.batch_size, self.concurrency, &self.org, |(user_id, groups)| async move {
            self.put_json(format!("{base}users/{user_id}/groups"), headers, to_json(groups)?)
                .await?;
            debug!(org = %self.org, user_id = %user_id, groups = groups.group_info_list.len(), "updated Sign user groups");
            Ok(())
        })
        .await;
        Ok(BatchReport::collect(
            updates.iter().map(|(id, _)| id.clone()),
            results,
            "update user groups",
            &self.org,
        ))
    }

    async fn deactivate_users(&self, user_ids: &[String]) -> Result<BatchReport> {
        if user_ids.is_empty() {
            return Ok(BatchReport::default());
        }
        let base = self.base_uri().await?;
        let headers = self.header_json();
        let headers = &headers;
        let body = to_json(&UserStateInfo {
            state: INACTIVE_STATUS.to_string(),
        })?;
        let body = &body;
        let results = run_batched(user_ids, self.batch_size, self.concurrency, &self.org, |user_id| async move {
            self.put_json(format!("{base}users/{user_id}/state"), headers, body.clone())
                .await?;
            info!(org = %self.org, user_id = %user_id, "deactivated Sign user");
            Ok(())
        })
        .await;
        Ok(BatchReport::collect(
            user_ids.iter().cloned(),
            results,
            "deactivate user",
            &self.org,
        ))
    }
}

/// Prefix `https://` unless the host already names a scheme.
fn host_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

fn page_url(url: &str, cursor: Option<&str>) -> Result<String> {
    match cursor {
        None => Ok(url.to_string()),
        Some(cursor) => Url::parse_with_params(url, &[("cursor", cursor)])
            .map(String::from)
            .map_err(|e| SignSyncError::Config(format!("invalid Sign API URL {url}: {e}"))),
    }
}

fn next_cursor(page: Option<crate::models::PageInfo>) -> Option<String> {
    page.and_then(|p| p.next_cursor).filter(|c| !c.is_empty())
}

fn parse<T: DeserializeOwned>(resp: &ApiResponse, what: &str) -> Result<T> {
    serde_json::from_str(&resp.body)
        .map_err(|e| SignSyncError::Serialization(format!("{what} parse failed: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| SignSyncError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserGroupInfo;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn org_config(host: &str) -> SignOrgConfig {
        SignOrgConfig {
            host: Some(host.to_string()),
            key: Some("test-key".to_string()),
            admin_email: Some("admin@example.com".to_string()),
            console_org: None,
            api_version: ApiVersion::V6,
            request_concurrency: 2,
            batch_size: 10,
            timeout_secs: 5,
            max_retries: 2,
        }
    }

    async fn mount_discovery(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/rest/v6/baseUris"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "apiAccessPoint": format!("{}/", server.uri()),
                "webAccessPoint": format!("{}/", server.uri())
            })))
            .mount(server)
            .await;
    }

    async fn setup() -> (MockServer, SignClient) {
        let server = MockServer::start().await;
        mount_discovery(&server).await;
        let client = SignClient::new(&org_config(&server.uri()))
            .unwrap()
            .with_retry_policy(RetryPolicy::new(2).with_initial_delay(Duration::ZERO));
        (server, client)
    }

    fn user_json(id: &str, email: &str, status: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "email": email,
            "firstName": "Test",
            "lastName": "User",
            "isAccountAdmin": false,
            "status": status
        })
    }

    #[test]
    fn missing_key_is_config_error() {
        let mut config = org_config("sign.example.com");
        config.key = None;
        let err = SignClient::new(&config).err().unwrap();
        assert!(matches!(err, SignSyncError::Config(_)));
        assert!(err
            .to_string()
            .contains("Key 'key' must be specified for all Sign orgs"));
    }

    #[test]
    fn host_without_scheme_gets_https() {
        assert_eq!(host_url("api.na1.echosign.com"), "https://api.na1.echosign.com");
        assert_eq!(host_url("http://127.0.0.1:8080/"), "http://127.0.0.1:8080");
        assert_eq!(host_url("https://secure.example.com"), "https://secure.example.com");
    }

    #[test]
    fn v6_headers_use_bearer_token() {
        let client = SignClient::new(&org_config("sign.example.com")).unwrap();
        assert_eq!(
            client.header(),
            vec![
                ("Authorization".to_string(), "Bearer test-key".to_string()),
                ("Connection".to_string(), "close".to_string()),
            ]
        );
        let json = client.header_json();
        assert_eq!(json.len(), 4);
        assert!(json.contains(&("Content-Type".to_string(), "application/json".to_string())));
        assert!(json.contains(&("Accept".to_string(), "application/json".to_string())));
        assert_eq!(
            client.discovery_url(),
            "https://sign.example.com/api/rest/v6/baseUris"
        );
    }

    #[test]
    fn v5_headers_use_access_token() {
        let mut config = org_config("sign.example.com");
        config.api_version = ApiVersion::V5;
        let client = SignClient::new(&config).unwrap();
        assert_eq!(
            client.header(),
            vec![("Access-Token".to_string(), "test-key".to_string())]
        );
        assert_eq!(
            client.discovery_url(),
            "https://sign.example.com/api/rest/v5/base_uris"
        );
    }

    #[test]
    fn org_label_defaults_to_main() {
        let mut config = org_config("sign.example.com");
        assert_eq!(SignClient::new(&config).unwrap().org_label(), "main");
        config.console_org = Some("secondary".into());
        assert_eq!(SignClient::new(&config).unwrap().org_label(), "secondary");
    }

    #[tokio::test]
    async fn base_uri_is_discovered_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/rest/v6/baseUris"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "apiAccessPoint": server.uri()
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/rest/v6/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "groupInfoList": []
            })))
            .mount(&server)
            .await;

        let client = SignClient::new(&org_config(&server.uri())).unwrap();
        assert_eq!(
            client.base_uri().await.unwrap(),
            format!("{}/api/rest/v6/", server.uri())
        );
        client.get_groups().await.unwrap();
        client.get_groups().await.unwrap();
    }

    #[tokio::test]
    async fn v5_discovery_and_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/rest/v5/base_uris"))
            .and(header("Access-Token", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "api_access_point": format!("{}/", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/rest/v5/groups"))
            .and(header("Access-Token", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "groupInfoList": [{"groupId": "g1", "groupName": "Sign Users"}]
            })))
            .mount(&server)
            .await;

        let mut config = org_config(&server.uri());
        config.api_version = ApiVersion::V5;
        let client = SignClient::new(&config).unwrap();
        let groups = client.get_groups().await.unwrap();
        assert_eq!(groups["sign users"].group_id, "g1");
    }

    #[tokio::test]
    async fn get_groups_follows_cursor() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/rest/v6/groups"))
            .and(query_param("cursor", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "groupInfoList": [{"groupId": "g2", "groupName": "Sign Group 1"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/rest/v6/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "groupInfoList": [
                    {"groupId": "abc12345", "groupName": "Default Group", "isDefaultGroup": true}
                ],
                "page": {"nextCursor": "page2"}
            })))
            .mount(&server)
            .await;

        let groups = client.get_groups().await.unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups["default group"].is_default_group);
        assert_eq!(groups["sign group 1"].group_id, "g2");
    }

    #[tokio::test]
    async fn create_group_returns_new_id() {
        let (server, client) = setup().await;

        Mock::given(method("POST"))
            .and(path("/api/rest/v6/groups"))
            .and(header("Content-Type", "application/json"))
            .and(body_json(serde_json::json!({"groupName": "Sign Group 2"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "new-g"})))
            .expect(1)
            .mount(&server)
            .await;

        let group = client.create_group("Sign Group 2").await.unwrap();
        assert_eq!(group.group_id, "new-g");
        assert_eq!(group.group_name, "Sign Group 2");
    }

    #[tokio::test]
    async fn get_users_skips_inactive_and_admin() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/rest/v6/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "userInfoList": [
                    {"id": "u1", "email": "User.One@example.com"},
                    {"id": "u2", "email": "gone@example.com"},
                    {"id": "u3", "email": "admin@example.com"}
                ]
            })))
            .mount(&server)
            .await;
        for (id, email, status) in [
            ("u1", "User.One@example.com", "ACTIVE"),
            ("u2", "gone@example.com", "INACTIVE"),
            ("u3", "admin@example.com", "ACTIVE"),
        ] {
            Mock::given(method("GET"))
                .and(path(format!("/api/rest/v6/users/{id}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(user_json(id, email, status)))
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/api/rest/v6/users/u1/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "groupInfoList": [
                    {"id": "g1", "name": "Sign Users", "isGroupAdmin": false, "isPrimaryGroup": true, "status": "ACTIVE"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fetched = client.get_users().await.unwrap();
        assert!(fetched.failures.is_empty());
        let users = fetched.users;
        assert_eq!(users.len(), 1);
        let user = &users["user.one@example.com"];
        assert_eq!(user.info.id, "u1");
        assert_eq!(user.groups.len(), 1);
        assert_eq!(user.groups[0].is_primary_group, Some(true));
    }

    #[tokio::test]
    async fn get_users_follows_cursor() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/rest/v6/users"))
            .and(query_param("cursor", "next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "userInfoList": [{"id": "u2"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/rest/v6/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "userInfoList": [{"id": "u1"}],
                "page": {"nextCursor": "next"}
            })))
            .mount(&server)
            .await;
        for (id, email) in [("u1", "a@example.com"), ("u2", "b@example.com")] {
            Mock::given(method("GET"))
                .and(path(format!("/api/rest/v6/users/{id}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(user_json(id, email, "ACTIVE")))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("/api/rest/v6/users/{id}/groups")))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({"groupInfoList": []})),
                )
                .mount(&server)
                .await;
        }

        let users = client.get_users().await.unwrap().users;
        assert_eq!(users.len(), 2);
        assert!(users.contains_key("a@example.com"));
        assert!(users.contains_key("b@example.com"));
    }

    #[tokio::test]
    async fn get_users_reports_user_that_cannot_be_fetched() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/rest/v6/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "userInfoList": [
                    {"id": "u1", "email": "ok@example.com"},
                    {"id": "u2", "email": "Broken@example.com"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/rest/v6/users/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(user_json("u1", "ok@example.com", "ACTIVE")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/rest/v6/users/u1/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"groupInfoList": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/rest/v6/users/u2"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let fetched = client.get_users().await.unwrap();
        assert_eq!(fetched.users.len(), 1);
        assert!(fetched.users.contains_key("ok@example.com"));
        assert_eq!(fetched.failures.len(), 1);
        assert_eq!(fetched.failures[0].user_id, "u2");
        assert!(matches!(
            fetched.failures[0].error,
            SignSyncError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(
            fetched.unfetched_emails().into_iter().collect::<Vec<_>>(),
            vec!["broken@example.com".to_string()]
        );
        assert!(!fetched.has_unidentified_failures());
    }

    #[tokio::test]
    async fn update_users_puts_full_record() {
        let (server, client) = setup().await;

        Mock::given(method("PUT"))
            .and(path("/api/rest/v6/users/u1"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "email": "user@example.com",
                "isAccountAdmin": true
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut user: DetailedUserInfo =
            serde_json::from_value(user_json("u1", "user@example.com", "ACTIVE")).unwrap();
        user.is_account_admin = true;

        let report = client.update_users(&[user]).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn update_users_reports_client_errors_without_retry() {
        let (server, client) = setup().await;

        Mock::given(method("PUT"))
            .and(path("/api/rest/v6/users/u1"))
            .respond_with(ResponseTemplate::new(404).set_body_string("{\"code\":\"INVALID_USER_ID\"}"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/rest/v6/users/u2"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let users: Vec<DetailedUserInfo> = [("u1", "a@example.com"), ("u2", "b@example.com")]
            .into_iter()
            .map(|(id, email)| serde_json::from_value(user_json(id, email, "ACTIVE")).unwrap())
            .collect();

        let report = client.update_users(&users).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, "a@example.com");
        assert_eq!(report.failures[0].error.status(), Some(404));
        assert!(report.failures[0].error.to_string().contains("INVALID_USER_ID"));
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_exhausted() {
        let (server, client) = setup().await;

        Mock::given(method("PUT"))
            .and(path("/api/rest/v6/users/u1/state"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let report = client.deactivate_users(&["u1".to_string()]).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0].error,
            SignSyncError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn deactivate_users_sets_inactive_state() {
        let (server, client) = setup().await;

        Mock::given(method("PUT"))
            .and(path("/api/rest/v6/users/u1/state"))
            .and(body_json(serde_json::json!({"state": "INACTIVE"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let report = client.deactivate_users(&["u1".to_string()]).await.unwrap();
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn update_user_groups_sends_membership_list() {
        let (server, client) = setup().await;

        Mock::given(method("PUT"))
            .and(path("/api/rest/v6/users/u1/groups"))
            .and(body_json(serde_json::json!({
                "groupInfoList": [{"id": "abc12345", "isGroupAdmin": false, "isPrimaryGroup": true}]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let update = UserGroupsInfo {
            group_info_list: vec![UserGroupInfo::new("abc12345", false, Some(true))],
        };
        let report = client
            .update_user_groups(&[("u1".to_string(), update)])
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn insert_user_returns_id() {
        let (server, client) = setup().await;

        Mock::given(method("POST"))
            .and(path("/api/rest/v6/users"))
            .and(body_partial_json(serde_json::json!({"email": "new@example.com"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "u9"})))
            .expect(1)
            .mount(&server)
            .await;

        let id = client
            .insert_user(&UserCreationInfo {
                email: "new@example.com".into(),
                first_name: Some("New".into()),
                last_name: Some("User".into()),
                is_account_admin: false,
            })
            .await
            .unwrap();
        assert_eq!(id, "u9");
    }

    #[tokio::test]
    async fn empty_bulk_calls_skip_the_network() {
        let server = MockServer::start().await;
        let client = SignClient::new(&org_config(&server.uri())).unwrap();

        assert_eq!(client.update_users(&[]).await.unwrap().total(), 0);
        assert_eq!(client.update_user_groups(&[]).await.unwrap().total(), 0);
        assert_eq!(client.deactivate_users(&[]).await.unwrap().total(), 0);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    /// Tracks how many calls are in flight at once.
    struct CountingTransport {
        base: String,
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
        calls: AtomicUsize,
    }

    impl CountingTransport {
        fn new() -> Self {
            Self {
                base: "https://api.test/".to_string(),
                in_flight: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
            if request.url.ends_with("baseUris") {
                let body = serde_json::json!({"apiAccessPoint": self.base}).to_string();
                return Ok(ApiResponse::new(200, &body));
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ApiResponse::new(200, "{}"))
        }
    }

    #[tokio::test]
    async fn in_flight_requests_never_exceed_concurrency_limit() {
        for n in [1usize, 5, 17] {
            for limit in [1usize, 2, 4] {
                let transport = Arc::new(CountingTransport::new());
                let mut config = org_config("sign.example.com");
                config.request_concurrency = limit;
                config.batch_size = 5;
                let client = SignClient::with_transport(&config, transport.clone()).unwrap();

                let ids: Vec<String> = (0..n).map(|i| format!("u{i}")).collect();
                let report = client.deactivate_users(&ids).await.unwrap();

                assert_eq!(report.succeeded, n);
                assert_eq!(transport.calls.load(Ordering::SeqCst), n);
                let max_seen = transport.max_seen.load(Ordering::SeqCst);
                assert!(max_seen <= limit, "n={n} limit={limit} saw {max_seen}");
                assert_eq!(max_seen, limit.min(5).min(n));
            }
        }
    }
}
