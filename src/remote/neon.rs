//! NF-062: HTTP client for the Neon control-plane API.
//!
//! Maps the four CRUD verbs onto the REST endpoints of each resource type.
//! Field names are camelCase in the engine and snake_case on the wire.

use super::{CrudApi, RemoteError, RemoteObject};
use crate::core::types::Fields;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://console.neon.tech/api/v2";

/// Wire mapping for one resource type.
struct Route {
    /// JSON envelope key, e.g. `{"branch": {...}}`
    envelope: &'static str,
    /// `(engine field, wire field)` pairs sent on create
    create_fields: &'static [(&'static str, &'static str)],
    /// `(engine field, wire field)` pairs sent on update; empty means not updatable
    update_fields: &'static [(&'static str, &'static str)],
    /// `(wire field, engine field)` pairs read back from responses
    response_fields: &'static [(&'static str, &'static str)],
    /// Objects addressed by name rather than by id
    by_name: bool,
}

const PROJECT: Route = Route {
    envelope: "project",
    create_fields: &[("name", "name"), ("regionId", "region_id")],
    update_fields: &[("name", "name")],
    response_fields: &[
        ("name", "name"),
        ("region_id", "regionId"),
        ("created_at", "createdAt"),
    ],
    by_name: false,
};

const BRANCH: Route = Route {
    envelope: "branch",
    create_fields: &[("name", "name")],
    update_fields: &[("name", "name")],
    response_fields: &[
        ("name", "name"),
        ("project_id", "projectId"),
        ("created_at", "createdAt"),
    ],
    by_name: false,
};

const ENDPOINT: Route = Route {
    envelope: "endpoint",
    create_fields: &[("branchId", "branch_id"), ("type", "type")],
    update_fields: &[("branchId", "branch_id")],
    response_fields: &[
        ("project_id", "projectId"),
        ("branch_id", "branchId"),
        ("type", "type"),
        ("host", "host"),
        ("created_at", "createdAt"),
    ],
    by_name: false,
};

const DATABASE: Route = Route {
    envelope: "database",
    create_fields: &[("name", "name"), ("ownerName", "owner_name")],
    update_fields: &[("name", "name"), ("ownerName", "owner_name")],
    response_fields: &[
        ("name", "name"),
        ("owner_name", "ownerName"),
        ("branch_id", "branchId"),
        ("created_at", "createdAt"),
    ],
    by_name: true,
};

const ROLE: Route = Route {
    envelope: "role",
    create_fields: &[("name", "name")],
    update_fields: &[],
    response_fields: &[
        ("name", "name"),
        ("branch_id", "branchId"),
        ("password", "password"),
        ("created_at", "createdAt"),
    ],
    by_name: true,
};

fn route(type_token: &str) -> Result<&'static Route, RemoteError> {
    match type_token {
        "neon:index:Project" => Ok(&PROJECT),
        "neon:index:Branch" => Ok(&BRANCH),
        "neon:index:Endpoint" => Ok(&ENDPOINT),
        "neon:index:Database" => Ok(&DATABASE),
        "neon:index:Role" => Ok(&ROLE),
        other => Err(RemoteError::fatal(format!(
            "resource type '{}' has no remote API",
            other
        ))),
    }
}

/// Client for one provider binding.
pub struct NeonApi {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl NeonApi {
    /// A client for `base_url`. A missing key surfaces at the first call.
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let http = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .user_agent(concat!("neonform/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::fatal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, RemoteError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| RemoteError::fatal("no API key configured for this provider"))?;
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "neon api request");

        let mut request = self.http.request(method, &url).bearer_auth(key);
        if let Some(token) = idempotency_key {
            request = request.header("Idempotency-Key", token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify(status, &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| RemoteError::Fatal {
            status: Some(status.as_u16()),
            message: format!("invalid JSON in response from {}: {}", path, e),
        })
    }
}

/// Map an error status to a failure class.
pub fn classify(status: StatusCode, body: &str) -> RemoteError {
    let detail: String = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());
    match status.as_u16() {
        404 => RemoteError::NotFound,
        408 | 429 | 500..=599 => RemoteError::Transient(format!("HTTP {}: {}", status.as_u16(), detail)),
        code => RemoteError::Fatal {
            status: Some(code),
            message: detail,
        },
    }
}

/// Only timeouts and failed connections are worth another attempt.
fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() || e.is_connect() {
        RemoteError::Transient(e.to_string())
    } else {
        RemoteError::fatal(e.to_string())
    }
}

fn field_str<'a>(fields: &'a Fields, name: &str) -> Result<&'a str, RemoteError> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::fatal(format!("missing '{}' to address the object", name)))
}

/// Percent-encode one path segment.
fn segment(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

/// Collection path for `type_token`, using parent ids from `fields`.
fn collection_path(type_token: &str, fields: &Fields) -> Result<String, RemoteError> {
    Ok(match type_token {
        "neon:index:Project" => "/projects".to_string(),
        "neon:index:Branch" => format!("/projects/{}/branches", segment(field_str(fields, "projectId")?)),
        "neon:index:Endpoint" => format!("/projects/{}/endpoints", segment(field_str(fields, "projectId")?)),
        "neon:index:Database" | "neon:index:Role" => {
            let kind = if type_token.ends_with("Database") {
                "databases"
            } else {
                "roles"
            };
            format!(
                "/projects/{}/branches/{}/{}",
                segment(field_str(fields, "projectId")?),
                segment(field_str(fields, "branchId")?),
                kind
            )
        }
        other => {
            return Err(RemoteError::fatal(format!(
                "resource type '{}' has no remote API",
                other
            )))
        }
    })
}

fn item_path(type_token: &str, id: &str, fields: &Fields) -> Result<String, RemoteError> {
    let r = route(type_token)?;
    let key = if r.by_name {
        fields.get("name").and_then(Value::as_str).unwrap_or(id)
    } else {
        id
    };
    Ok(format!("{}/{}", collection_path(type_token, fields)?, segment(key)))
}

fn envelope(route: &Route, pairs: &[(&str, &str)], fields: &Fields) -> Value {
    let mut inner = Map::new();
    for (engine, wire) in pairs {
        if let Some(v) = fields.get(*engine).filter(|v| !v.is_null()) {
            inner.insert(wire.to_string(), v.clone());
        }
    }
    let mut outer = Map::new();
    outer.insert(route.envelope.to_string(), Value::Object(inner));
    Value::Object(outer)
}

/// Turn a response body into a remote object, layered over `request` fields.
fn parse_object(route: &Route, body: &Value, request: &Fields, fallback_id: &str) -> Result<RemoteObject, RemoteError> {
    let obj = body
        .get(route.envelope)
        .and_then(Value::as_object)
        .ok_or_else(|| RemoteError::fatal(format!("response has no '{}' object", route.envelope)))?;
    let mut fields = request.clone();
    for (wire, engine) in route.response_fields {
        if let Some(v) = obj.get(*wire).filter(|v| !v.is_null()) {
            fields.insert(engine.to_string(), v.clone());
        }
    }
    let id = if route.by_name && route.envelope == "role" {
        obj.get("name").and_then(Value::as_str).map(str::to_string)
    } else {
        obj.get("id").map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
    .unwrap_or_else(|| fallback_id.to_string());
    if id.is_empty() {
        return Err(RemoteError::fatal("response carries no identity"));
    }
    Ok(RemoteObject { id, fields })
}

#[async_trait]
impl CrudApi for NeonApi {
    async fn create(
        &self,
        type_token: &str,
        idempotency_key: &str,
        inputs: &Fields,
    ) -> Result<RemoteObject, RemoteError> {
        let r = route(type_token)?;
        let path = collection_path(type_token, inputs)?;
        let body = envelope(r, r.create_fields, inputs);
        let response = self
            .send(Method::POST, &path, Some(body), Some(idempotency_key))
            .await?;
        parse_object(r, &response, inputs, "")
    }

    async fn read(&self, type_token: &str, id: &str, inputs: &Fields) -> Result<RemoteObject, RemoteError> {
        let r = route(type_token)?;
        let path = item_path(type_token, id, inputs)?;
        let response = self.send(Method::GET, &path, None, None).await?;
        parse_object(r, &response, inputs, id)
    }

    async fn update(
        &self,
        type_token: &str,
        id: &str,
        olds: &Fields,
        news: &Fields,
    ) -> Result<RemoteObject, RemoteError> {
        let r = route(type_token)?;
        if r.update_fields.is_empty() {
            return Err(RemoteError::fatal(format!("{} cannot be updated in place", type_token)));
        }
        // Name-addressed objects are reached through their last-known name.
        let path = item_path(type_token, id, olds)?;
        let body = envelope(r, r.update_fields, news);
        let response = self.send(Method::PATCH, &path, Some(body), None).await?;
        parse_object(r, &response, news, id)
    }

    async fn delete(&self, type_token: &str, id: &str, inputs: &Fields) -> Result<(), RemoteError> {
        let path = item_path(type_token, id, inputs)?;
        self.send(Method::DELETE, &path, None, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_nf062_classify_status() {
        assert_eq!(classify(StatusCode::NOT_FOUND, ""), RemoteError::NotFound);
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
        assert!(classify(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(classify(StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert_eq!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, r#"{"message":"bad region"}"#),
            RemoteError::Fatal {
                status: Some(422),
                message: "bad region".into()
            }
        );
    }

    #[test]
    fn test_nf062_paths() {
        let f = fields(&[
            ("projectId", json!("p-1")),
            ("branchId", json!("br-2")),
            ("name", json!("app db")),
        ]);
        assert_eq!(collection_path("neon:index:Project", &f).unwrap(), "/projects");
        assert_eq!(
            item_path("neon:index:Branch", "br-2", &f).unwrap(),
            "/projects/p-1/branches/br-2"
        );
        assert_eq!(
            item_path("neon:index:Database", "17", &f).unwrap(),
            "/projects/p-1/branches/br-2/databases/app%20db"
        );
        assert_eq!(
            item_path("neon:index:Endpoint", "ep-1", &f).unwrap(),
            "/projects/p-1/endpoints/ep-1"
        );
        assert!(collection_path("neon:index:Branch", &Fields::new()).is_err());
        assert!(route("neon:index:Random").is_err());
    }

    #[test]
    fn test_nf062_create_body_uses_wire_names() {
        let f = fields(&[
            ("name", json!("demo")),
            ("regionId", json!("aws-us-east-2")),
        ]);
        assert_eq!(
            envelope(&PROJECT, PROJECT.create_fields, &f),
            json!({"project": {"name": "demo", "region_id": "aws-us-east-2"}})
        );
        let db = fields(&[("name", json!("app")), ("ownerName", Value::Null)]);
        assert_eq!(
            envelope(&DATABASE, DATABASE.create_fields, &db),
            json!({"database": {"name": "app"}})
        );
    }

    #[test]
    fn test_nf062_parse_response() {
        let request = fields(&[("projectId", json!("p-1")), ("name", json!("main"))]);
        let body = json!({"branch": {"id": "br-9", "name": "main", "created_at": "2026-01-01T00:00:00Z"}});
        let obj = parse_object(&BRANCH, &body, &request, "").unwrap();
        assert_eq!(obj.id, "br-9");
        assert_eq!(obj.fields["createdAt"], json!("2026-01-01T00:00:00Z"));
        assert_eq!(obj.fields["projectId"], json!("p-1"));

        let db = json!({"database": {"id": 42, "name": "app"}});
        assert_eq!(parse_object(&DATABASE, &db, &request, "").unwrap().id, "42");

        let role = json!({"role": {"name": "app_user", "password": "pw"}});
        let obj = parse_object(&ROLE, &role, &request, "").unwrap();
        assert_eq!(obj.id, "app_user");
        assert_eq!(obj.fields["password"], json!("pw"));

        assert!(parse_object(&BRANCH, &json!({}), &request, "").is_err());
    }

    #[tokio::test]
    async fn test_nf062_missing_api_key_is_fatal() {
        let api = NeonApi::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        let err = api
            .create("neon:index:Project", "k", &Fields::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Fatal { status: None, .. }));
        assert!(err.to_string().contains("API key"));
    }

    #[tokio::test]
    async fn test_nf062_transport_errors() {
        let key = Some("k".to_string());
        // A request that cannot be built is not worth retrying.
        let broken = NeonApi::new("http://exa mple.invalid", key.clone(), Duration::from_secs(1)).unwrap();
        let err = broken.read("neon:index:Project", "p-1", &Fields::new()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Fatal { status: None, .. }), "{:?}", err);

        let refused = NeonApi::new("http://127.0.0.1:9", key, Duration::from_secs(1)).unwrap();
        let err = refused.read("neon:index:Project", "p-1", &Fields::new()).await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
    }
}
