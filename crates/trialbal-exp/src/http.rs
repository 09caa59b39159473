use std::collections::BTreeMap;
use std::time::Duration;

use indexmap::IndexMap;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use trialbal_core::{
    CovariateKind, ErrorInfo, Features, GroupMembership, ProtocolConfig, TrialError,
};

use crate::service::AllocationService;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireProtocol<'a> {
    group_names: &'a [String],
    variable_spec: IndexMap<&'a str, Option<&'a [String]>>,
    allow_revision: bool,
    algorithm: &'static str,
}

impl<'a> WireProtocol<'a> {
    fn from_config(config: &'a ProtocolConfig) -> Self {
        let variable_spec = config
            .covariate_specs()
            .map(|spec| {
                let levels = match &spec.kind {
                    CovariateKind::Continuous { .. } => None,
                    CovariateKind::Categorical { levels } => Some(levels.as_slice()),
                };
                (spec.name.as_str(), levels)
            })
            .collect();
        Self {
            group_names: &config.group_names,
            variable_spec,
            allow_revision: config.allow_revision,
            algorithm: config.algorithm.as_str(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireGroup {
    name: String,
    #[serde(default)]
    subjects: Vec<WireSubject>,
}

#[derive(Debug, Deserialize)]
struct WireSubject {
    id: String,
}

/// Which call a response belongs to; `start` maps 400 to a protocol conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Start,
    Other,
}

/// Blocking REST client for a remote allocation server.
///
/// Paths follow `/{instance}/start`, `/{instance}/subject/{id}[/group]`,
/// `/{instance}/assignall`, `/{instance}/groups` and `/{instance}/stop`.
#[derive(Debug, Clone)]
pub struct HttpAllocationService {
    base: String,
    client: Client,
}

impl HttpAllocationService {
    /// Connects to the server rooted at `base_url` (for example `http://localhost:8080`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, TrialError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| transport("client-build", err))?;
        Ok(Self {
            base: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Marks a subject as committed on the server.
    pub fn commit(&mut self, instance: &str, subject: &str) -> Result<(), TrialError> {
        let url = self.url(instance, &["subject", subject, "commit"]);
        self.send(self.client.post(url), Call::Other, instance).map(|_| ())
    }

    /// Asks the server whether a subject is committed.
    pub fn is_committed(&mut self, instance: &str, subject: &str) -> Result<bool, TrialError> {
        let url = self.url(instance, &["subject", subject, "committed"]);
        let response = self.send(self.client.get(url), Call::Other, instance)?;
        response.json().map_err(|err| transport("decode-committed", err))
    }

    fn url(&self, instance: &str, parts: &[&str]) -> String {
        format!("{}/{}/{}", self.base, instance, parts.join("/"))
    }

    fn send(&self, request: RequestBuilder, call: Call, instance: &str) -> Result<Response, TrialError> {
        let response = request.send().map_err(|err| {
            transport("request", err).with_context("instance", instance.to_string())
        })?;
        let status = response.status();
        debug!(instance, status = status.as_u16(), "allocation server replied");
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        let info = ErrorInfo::new(format!("http-{}", status.as_u16()), "allocation server rejected the request")
            .with_context("instance", instance.to_string())
            .with_hint(body);
        Err(match (status, call) {
            (StatusCode::NOT_FOUND, _) => TrialError::NotFound(info),
            (StatusCode::BAD_REQUEST, Call::Start) => TrialError::ProtocolConflict(info),
            (StatusCode::BAD_REQUEST, Call::Other) => TrialError::InvalidData(info),
            _ => TrialError::Transport(info),
        })
    }
}

fn wire_features(features: &Features) -> BTreeMap<&str, String> {
    features
        .iter()
        .map(|(name, value)| (name.as_str(), value.to_string()))
        .collect()
}

fn transport(code: &str, err: reqwest::Error) -> TrialError {
    TrialError::Transport(ErrorInfo::new(code, err.to_string()))
}

impl AllocationService for HttpAllocationService {
    fn start(&mut self, instance: &str, config: &ProtocolConfig) -> Result<(), TrialError> {
        let url = format!("{}?temp=true", self.url(instance, &["start"]));
        let body = WireProtocol::from_config(config);
        self.send(self.client.post(url).json(&body), Call::Start, instance)
            .map(|_| ())
    }

    fn submit(&mut self, instance: &str, subject: &str, features: &Features) -> Result<(), TrialError> {
        let url = self.url(instance, &["subject", subject]);
        let body = wire_features(features);
        self.send(self.client.post(url).json(&body), Call::Other, instance)
            .map(|_| ())
    }

    fn submit_and_assign(
        &mut self,
        instance: &str,
        subject: &str,
        features: &Features,
    ) -> Result<String, TrialError> {
        let url = self.url(instance, &["subject", subject, "group"]);
        let body = wire_features(features);
        let response = self.send(self.client.post(url).json(&body), Call::Other, instance)?;
        response.text().map_err(|err| transport("decode-group", err))
    }

    fn get_group(&mut self, instance: &str, subject: &str) -> Result<String, TrialError> {
        let url = self.url(instance, &["subject", subject, "group"]);
        let response = self.send(self.client.get(url), Call::Other, instance)?;
        response.text().map_err(|err| transport("decode-group", err))
    }

    fn assign_all(&mut self, instance: &str) -> Result<(), TrialError> {
        let url = self.url(instance, &["assignall"]);
        self.send(self.client.post(url), Call::Other, instance).map(|_| ())
    }

    fn get_groups(&mut self, instance: &str) -> Result<Vec<GroupMembership>, TrialError> {
        let url = self.url(instance, &["groups"]);
        let response = self.send(self.client.get(url), Call::Other, instance)?;
        let groups: Vec<WireGroup> = response.json().map_err(|err| transport("decode-groups", err))?;
        Ok(groups
            .into_iter()
            .map(|group| GroupMembership {
                name: group.name,
                subject_ids: group.subjects.into_iter().map(|subject| subject.id).collect(),
            })
            .collect())
    }

    fn stop(&mut self, instance: &str) -> Result<(), TrialError> {
        let url = self.url(instance, &["stop"]);
        self.send(self.client.delete(url), Call::Other, instance).map(|_| ())
    }
}
