use anyhow::Context;
use bytes::Bytes;
use http::header::{HeaderName, HOST};
use http::{HeaderMap, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::client::ClientSettings;
use crate::error::ConfigError;
use crate::hooks::{Hooks, RequestHook, ResponseHook};

/// Run bounds and the defaults every step inherits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Total iterations across all workers; mutually exclusive with `duration_ms`
    pub number: u64,
    /// Number of parallel workers
    pub concurrency: u64,
    /// Run length in milliseconds; mutually exclusive with `number`
    pub duration_ms: u64,
    /// Default request timeout in milliseconds, 0 disables it
    pub timeout_ms: u64,
    /// Default pause after each step in milliseconds
    pub think_time_ms: u64,
    /// Default HTTP proxy, "host:port" or a full URL
    pub proxy: Option<String>,
    /// Default Host header override
    pub host: Option<String>,
    /// Headers sent by every step unless the step sets the same name
    pub headers: BTreeMap<String, String>,
    pub h2: bool,
    pub disable_compression: bool,
    pub disable_keepalive: bool,
    pub disable_redirects: bool,
    /// Directory receiving report.txt and one CSV file per URL
    pub output: Option<PathBuf>,
    /// Adds the latency percentile table to the report
    pub percentiles: bool,
    /// Installs a Ctrl-C handler for the duration of the run
    pub handle_interrupt: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            number: 0,
            concurrency: 1,
            duration_ms: 0,
            timeout_ms: 20_000,
            think_time_ms: 0,
            proxy: None,
            host: None,
            headers: BTreeMap::new(),
            h2: false,
            disable_compression: false,
            disable_keepalive: false,
            disable_redirects: false,
            output: None,
            percentiles: false,
            handle_interrupt: true,
        }
    }
}

impl TaskConfig {
    /// Fixed-count run of `number` iterations spread over `concurrency` workers.
    pub fn iterations(number: u64, concurrency: u64) -> Self {
        Self {
            number,
            concurrency,
            ..Self::default()
        }
    }

    /// Time-bounded run with `concurrency` workers.
    pub fn timed(duration: Duration, concurrency: u64) -> Self {
        Self {
            duration_ms: duration.as_millis() as u64,
            concurrency,
            ..Self::default()
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        (self.duration_ms > 0).then(|| Duration::from_millis(self.duration_ms))
    }

    /// Checks the run bounds, in the order they are reported.
    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.number == 0 && self.duration_ms == 0 {
            return Err(ConfigError::MissingBound);
        }
        if self.number != 0 && self.duration_ms != 0 {
            return Err(ConfigError::ConflictingBounds);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Concurrency);
        }
        if self.number > 0 && self.number < self.concurrency {
            return Err(ConfigError::NumberBelowConcurrency {
                number: self.number,
                concurrency: self.concurrency,
            });
        }
        if self.number > 0 && self.number % self.concurrency != 0 {
            return Err(ConfigError::NumberNotMultiple {
                number: self.number,
                concurrency: self.concurrency,
            });
        }
        Ok(())
    }
}

/// One endpoint of a transaction. Unset options inherit the task defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub url: String,
    pub method: String,
    /// Request body given inline
    pub body: Option<String>,
    /// Request body read from a file by [`StepConfig::load_body`]
    pub body_file: Option<PathBuf>,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
    pub think_time_ms: Option<u64>,
    pub proxy: Option<String>,
    pub host: Option<String>,
    pub h2: Option<bool>,
    pub disable_compression: Option<bool>,
    pub disable_keepalive: Option<bool>,
    pub disable_redirects: Option<bool>,

    #[serde(skip)]
    pub hooks: Hooks,
    #[serde(skip)]
    payload: Option<Bytes>,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            body: None,
            body_file: None,
            headers: BTreeMap::new(),
            timeout_ms: None,
            think_time_ms: None,
            proxy: None,
            host: None,
            h2: None,
            disable_compression: None,
            disable_keepalive: None,
            disable_redirects: None,
            hooks: Hooks::default(),
            payload: None,
        }
    }
}

impl StepConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Sets the raw request body, taking precedence over `body` and `body_file`.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.payload = Some(body.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn think_time(mut self, think_time: Duration) -> Self {
        self.think_time_ms = Some(think_time.as_millis() as u64);
        self
    }

    pub fn before_request(mut self, hook: impl RequestHook + 'static) -> Self {
        self.hooks = self.hooks.before_request(hook);
        self
    }

    pub fn after_response(mut self, hook: impl ResponseHook + 'static) -> Self {
        self.hooks = self.hooks.after_response(hook);
        self
    }

    /// Reads `body_file` through `read_file`, if one is set.
    pub fn load_body<F>(&mut self, read_file: F) -> anyhow::Result<()>
    where
        F: Fn(&Path) -> std::io::Result<Vec<u8>>,
    {
        if self.payload.is_some() {
            return Ok(());
        }
        if let Some(path) = &self.body_file {
            let data = read_file(path)
                .with_context(|| format!("Failed to read body file {}", path.display()))?;
            self.payload = Some(Bytes::from(data));
        }
        Ok(())
    }

    fn payload(&self, index: usize) -> Result<Bytes, ConfigError> {
        if let Some(payload) = &self.payload {
            return Ok(payload.clone());
        }
        if let Some(path) = &self.body_file {
            return Err(ConfigError::UnloadedBody {
                index,
                path: path.clone(),
            });
        }
        Ok(self
            .body
            .as_ref()
            .map(|b| Bytes::from(b.clone()))
            .unwrap_or_default())
    }
}

/// A step with every default applied and every field parsed.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedStep {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Option<Duration>,
    pub think_time: Duration,
    pub settings: ClientSettings,
    pub hooks: Hooks,
}

/// Validates the task against `steps` and resolves each step's options.
pub(crate) fn resolve(
    task: &TaskConfig,
    steps: &[StepConfig],
) -> Result<Vec<ResolvedStep>, ConfigError> {
    task.check_bounds()?;
    if steps.is_empty() {
        return Err(ConfigError::NoSteps);
    }
    steps
        .iter()
        .enumerate()
        .map(|(index, step)| resolve_step(index, task, step))
        .collect()
}

fn resolve_step(
    index: usize,
    task: &TaskConfig,
    step: &StepConfig,
) -> Result<ResolvedStep, ConfigError> {
    let url_str = step.url.trim();
    let method_str = step.method.trim();
    if url_str.is_empty() || method_str.is_empty() {
        return Err(ConfigError::MissingUrlOrMethod { index });
    }

    let invalid_url = |reason: String| ConfigError::InvalidUrl {
        index,
        url: url_str.to_string(),
        reason,
    };
    let url = Url::parse(url_str).map_err(|e| invalid_url(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid_url("scheme must be http or https".to_string()));
    }
    if url.host_str().is_none() {
        return Err(invalid_url("missing host".to_string()));
    }

    let method = Method::from_bytes(method_str.to_uppercase().as_bytes()).map_err(|_| {
        ConfigError::InvalidMethod {
            index,
            method: method_str.to_string(),
        }
    })?;

    let mut headers = HeaderMap::new();
    for (name, value) in task.headers.iter().chain(step.headers.iter()) {
        let (name, value) = parse_header(name, value)?;
        headers.insert(name, value);
    }
    if let Some(host) = step.host.as_ref().or(task.host.as_ref()) {
        let (_, value) = parse_header(HOST.as_str(), host)?;
        headers.insert(HOST, value);
    }

    let proxy = step
        .proxy
        .as_deref()
        .or(task.proxy.as_deref())
        .map(parse_proxy)
        .transpose()?;

    let timeout_ms = step.timeout_ms.unwrap_or(task.timeout_ms);
    let think_time_ms = step.think_time_ms.unwrap_or(task.think_time_ms);

    Ok(ResolvedStep {
        method,
        url,
        headers,
        body: step.payload(index)?,
        timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        think_time: Duration::from_millis(think_time_ms),
        settings: ClientSettings {
            proxy,
            h2: step.h2.unwrap_or(task.h2),
            keep_alive: !step.disable_keepalive.unwrap_or(task.disable_keepalive),
            compression: !step.disable_compression.unwrap_or(task.disable_compression),
            follow_redirects: !step.disable_redirects.unwrap_or(task.disable_redirects),
        },
        hooks: step.hooks.clone(),
    })
}

/// Parses a `Name: value` pair into typed header parts.
pub fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidHeader {
        name: name.to_string(),
        reason,
    };
    let header_name =
        HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| invalid(e.to_string()))?;
    let header_value = HeaderValue::from_str(value.trim()).map_err(|e| invalid(e.to_string()))?;
    Ok((header_name, header_value))
}

/// Accepts "host:port" or a full `http://` URL.
pub fn parse_proxy(address: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidProxy {
        address: address.to_string(),
        reason,
    };
    let address = address.trim();
    let url = if address.contains("://") {
        Url::parse(address)
    } else {
        Url::parse(&format!("http://{address}"))
    }
    .map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "http" {
        return Err(invalid("only http proxies are supported".to_string()));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

/// A run plan loaded from TOML: a `[task]` table and one `[[step]]` per endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default, rename = "step")]
    pub steps: Vec<StepConfig>,
}

impl Plan {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        let plan: Plan = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse plan {}", path.display()))?;
        Ok(plan)
    }

    /// Loads every step's `body_file` through `read_file`.
    pub fn load_bodies<F>(&mut self, read_file: F) -> anyhow::Result<()>
    where
        F: Fn(&Path) -> std::io::Result<Vec<u8>>,
    {
        for step in &mut self.steps {
            step.load_body(&read_file)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_serde() {
        let plan_str = r#"
[task]
number = 100
concurrency = 10
timeout_ms = 5000

[task.headers]
Content-Type = "text/html"

[[step]]
url = "http://localhost:8080/login"
method = "post"
body = "user=demo"
think_time_ms = 250

[[step]]
url = "http://localhost:8080/profile"
method = "GET"
disable_keepalive = true
        "#;

        let plan: Plan = toml::from_str(plan_str).unwrap();
        assert_eq!(plan.task.number, 100);
        assert_eq!(plan.task.concurrency, 10);
        assert_eq!(plan.task.timeout_ms, 5000);
        assert!(plan.task.handle_interrupt);
        assert_eq!(plan.task.headers["Content-Type"], "text/html");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].body.as_deref(), Some("user=demo"));
        assert_eq!(plan.steps[0].think_time_ms, Some(250));
        assert_eq!(plan.steps[1].disable_keepalive, Some(true));

        let resolved = resolve(&plan.task, &plan.steps).unwrap();
        assert_eq!(resolved[0].method, Method::POST);
        assert_eq!(resolved[0].body.as_ref(), b"user=demo");
        assert_eq!(resolved[0].think_time, Duration::from_millis(250));
        assert_eq!(resolved[1].timeout, Some(Duration::from_millis(5000)));
        assert!(!resolved[1].settings.keep_alive);
        assert!(resolved[0].settings.keep_alive);
        assert_eq!(resolved[1].headers["content-type"], "text/html");
    }

    #[test]
    fn test_bounds_are_checked_in_order() {
        let task = TaskConfig {
            concurrency: 0,
            ..TaskConfig::default()
        };
        assert!(matches!(task.check_bounds(), Err(ConfigError::MissingBound)));

        let task = TaskConfig {
            number: 10,
            duration_ms: 1000,
            ..TaskConfig::default()
        };
        assert!(matches!(task.check_bounds(), Err(ConfigError::ConflictingBounds)));

        let task = TaskConfig::iterations(10, 0);
        assert!(matches!(task.check_bounds(), Err(ConfigError::Concurrency)));

        let task = TaskConfig::iterations(5, 10);
        assert!(matches!(
            task.check_bounds(),
            Err(ConfigError::NumberBelowConcurrency { .. })
        ));

        let task = TaskConfig::iterations(25, 10);
        assert!(matches!(
            task.check_bounds(),
            Err(ConfigError::NumberNotMultiple { .. })
        ));

        assert!(TaskConfig::iterations(100, 10).check_bounds().is_ok());
        assert!(TaskConfig::timed(Duration::from_secs(1), 3).check_bounds().is_ok());
    }

    #[test]
    fn test_step_validation() {
        let task = TaskConfig::iterations(1, 1);
        assert!(matches!(resolve(&task, &[]), Err(ConfigError::NoSteps)));

        let missing = StepConfig::new("http://a.test/").method("");
        assert!(matches!(
            resolve(&task, &[missing]),
            Err(ConfigError::MissingUrlOrMethod { index: 0 })
        ));

        let bad_scheme = StepConfig::new("ftp://example.com/file");
        assert!(matches!(
            resolve(&task, &[StepConfig::new("http://a.test/"), bad_scheme]),
            Err(ConfigError::InvalidUrl { index: 1, .. })
        ));

        let bad_method = StepConfig::new("http://a.test/").method("GE T");
        assert!(matches!(
            resolve(&task, &[bad_method]),
            Err(ConfigError::InvalidMethod { .. })
        ));

        let bad_header = StepConfig::new("http://a.test/").header("bad header", "x");
        assert!(matches!(
            resolve(&task, &[bad_header]),
            Err(ConfigError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_step_overrides_task_defaults() {
        let mut task = TaskConfig::iterations(1, 1);
        task.think_time_ms = 1000;
        task.host = Some("global.test".to_string());
        task.proxy = Some("127.0.0.1:3128".to_string());
        task.disable_compression = true;
        task.headers.insert("X-Env".to_string(), "global".to_string());

        let mut step = StepConfig::new("http://a.test/")
            .header("x-env", "step")
            .think_time(Duration::from_millis(10));
        step.host = Some("step.test".to_string());
        step.disable_compression = Some(false);

        let resolved = resolve(&task, &[step, StepConfig::new("http://b.test/")]).unwrap();
        assert_eq!(resolved[0].headers["x-env"], "step");
        assert_eq!(resolved[0].headers[HOST], "step.test");
        assert_eq!(resolved[0].think_time, Duration::from_millis(10));
        assert!(resolved[0].settings.compression);

        assert_eq!(resolved[1].headers["x-env"], "global");
        assert_eq!(resolved[1].headers[HOST], "global.test");
        assert_eq!(resolved[1].think_time, Duration::from_secs(1));
        assert!(!resolved[1].settings.compression);
        assert_eq!(
            resolved[1].settings.proxy.as_ref().map(|u| u.as_str()),
            Some("http://127.0.0.1:3128/")
        );
    }

    #[test]
    fn test_body_file_must_be_loaded() {
        let task = TaskConfig::iterations(1, 1);
        let mut step = StepConfig::new("http://a.test/").method("POST");
        step.body_file = Some(PathBuf::from("payload.json"));
        assert!(matches!(
            resolve(&task, std::slice::from_ref(&step)),
            Err(ConfigError::UnloadedBody { index: 0, .. })
        ));

        step.load_body(|path: &Path| {
            assert_eq!(path, Path::new("payload.json"));
            Ok(b"{\"ok\":true}".to_vec())
        })
        .unwrap();
        let resolved = resolve(&task, &[step]).unwrap();
        assert_eq!(resolved[0].body.as_ref(), b"{\"ok\":true}");
    }

    #[test]
    fn test_parse_proxy_forms() {
        assert_eq!(
            parse_proxy("localhost:8888").unwrap().as_str(),
            "http://localhost:8888/"
        );
        assert!(parse_proxy("http://10.0.0.1:3128").is_ok());
        assert!(matches!(
            parse_proxy("socks5://10.0.0.1:1080"),
            Err(ConfigError::InvalidProxy { .. })
        ));
    }
}
