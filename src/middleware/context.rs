//! Framework-neutral view of an inbound request.

use std::collections::HashMap;

use axum::http::{HeaderMap, Method, header, request::Parts};
use serde_json::{Map, Value};

use crate::audit::{Actor, request_context};
use crate::csrf::cookie::parse_cookies;
use crate::identity::Identity;

/// Everything the security stages read from a request, built once.
#[derive(Debug, Clone)]
pub struct SecurityRequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub cookies: HashMap<String, String>,
    pub client_ip: String,
    pub correlation_id: String,
    pub identity: Identity,
}

impl SecurityRequestContext {
    pub fn from_parts(parts: &Parts, client_ip: String, correlation_id: String) -> Self {
        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            cookies: parse_cookies(&parts.headers),
            headers: parts.headers.clone(),
            client_ip,
            correlation_id,
            identity: Identity::anonymous(),
        }
    }

    /// GET, HEAD and OPTIONS never change state.
    pub fn is_safe_method(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
    }

    /// Rate-limit key before the route suffix: `user:<id>` for verified
    /// users, `ip:<address>` otherwise.
    pub fn rate_limit_subject(&self) -> String {
        match self.identity.verified_user_id() {
            Some(user) => format!("user:{user}"),
            None => format!("ip:{}", self.client_ip),
        }
    }

    pub fn actor(&self) -> Actor {
        Actor {
            user_id: self.identity.user_id.clone(),
            ip: Some(self.client_ip.clone()),
            user_agent: self
                .header(header::USER_AGENT.as_str())
                .map(str::to_string),
        }
    }

    pub fn audit_context(&self) -> Map<String, Value> {
        request_context(&self.path, self.method.as_str(), &self.correlation_id)
    }
}
